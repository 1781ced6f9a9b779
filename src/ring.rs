//! Shared debug ring.
//!
//! A single region shared between the loader and the microkernel: two
//! `u64` cursors at offset 0 (`spos` for the consumer, `epos` for the
//! producer) followed by the byte buffer. The microkernel appends and
//! advances `epos`; the loader drains and advances `spos`. Positions are
//! free-running and wrap via modulo on the buffer size.

use crate::error::Result;
use crate::layout::DEBUG_RING_SIZE;
use crate::platform::{alloc_pages, Platform};
use crate::span::MutableSpan;

const SPOS_OFFSET: usize = 0;
const EPOS_OFFSET: usize = 8;
const BUF_OFFSET: usize = 16;

/// The loader-side handle to the shared debug ring.
#[derive(Debug)]
pub struct DebugRing {
    region: MutableSpan,
}

impl DebugRing {
    /// Allocate the ring region. Lives until [`DebugRing::free`].
    pub fn alloc(platform: &dyn Platform) -> Result<Self> {
        let region = alloc_pages(platform, DEBUG_RING_SIZE, "debug ring")?;
        Ok(Self { region })
    }

    /// Reset both cursors to zero. Called at every VMM start so stale
    /// output from a previous run is not replayed.
    pub fn reset(&mut self) {
        self.write_cursor(SPOS_OFFSET, 0);
        self.write_cursor(EPOS_OFFSET, 0);
    }

    /// Host-virtual address of the region.
    pub fn addr(&self) -> *mut u8 {
        self.region.addr
    }

    /// Size of the region in bytes, cursors included.
    pub fn size(&self) -> u64 {
        self.region.size
    }

    /// Capacity of the byte buffer.
    pub fn capacity(&self) -> u64 {
        self.region.size - BUF_OFFSET as u64
    }

    /// Drain pending bytes into `out`, advancing `spos`. Returns the
    /// number of bytes written.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let spos = self.read_cursor(SPOS_OFFSET);
        let epos = self.read_cursor(EPOS_OFFSET);
        let pending = (epos.wrapping_sub(spos)).min(out.len() as u64);

        let cap = self.capacity();
        for idx in 0..pending {
            let src = BUF_OFFSET as u64 + (spos.wrapping_add(idx)) % cap;
            out[idx as usize] = unsafe { *self.region.addr.add(src as usize) };
        }

        self.write_cursor(SPOS_OFFSET, spos.wrapping_add(pending));
        pending as usize
    }

    /// Log the ring's location and occupancy.
    pub fn dump(&self) {
        let spos = self.read_cursor(SPOS_OFFSET);
        let epos = self.read_cursor(EPOS_OFFSET);
        log::debug!(
            "debug ring: addr {:p} size 0x{:x} spos 0x{spos:x} epos 0x{epos:x}",
            self.region.addr,
            self.region.size,
        );
    }

    /// Release the ring region.
    pub fn free(&mut self, platform: &dyn Platform) {
        self.region.free(platform);
    }

    fn read_cursor(&self, offset: usize) -> u64 {
        unsafe { (self.region.addr.add(offset) as *const u64).read_volatile() }
    }

    fn write_cursor(&mut self, offset: usize, value: u64) {
        unsafe { (self.region.addr.add(offset) as *mut u64).write_volatile(value) };
    }

    #[cfg(test)]
    pub(crate) fn produce(&mut self, bytes: &[u8]) {
        // Test stand-in for the microkernel side of the ring.
        let epos = self.read_cursor(EPOS_OFFSET);
        let cap = self.capacity();
        for (idx, &byte) in bytes.iter().enumerate() {
            let dst = BUF_OFFSET as u64 + (epos.wrapping_add(idx as u64)) % cap;
            unsafe { *self.region.addr.add(dst as usize) = byte };
        }
        self.write_cursor(EPOS_OFFSET, epos.wrapping_add(bytes.len() as u64));
    }
}
