//! Platform port abstraction.
//!
//! The loader never talks to the OS kernel directly; everything it needs
//! (page allocation, user-memory copies, physical address translation,
//! per-CPU fan-out) goes through the [`Platform`] trait. The kernel shim
//! that embeds this crate provides the implementation.
//!
//! The trait keeps the C-shaped contract of the shim surface (nullable
//! pointers, `i64` status returns); the helpers below lift those into
//! [`Result`] for the rest of the crate.

use crate::error::{Error, Result};
use crate::span::MutableSpan;

/// Order in which a per-CPU fan-out visits logical processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOrder {
    /// CPU 0 through N-1.
    Forward,
    /// CPU N-1 down to 0.
    Reverse,
}

/// The surface the loader requires from the embedding kernel.
///
/// Implementations must be callable from the loader's single control
/// thread; `on_each_cpu` additionally runs the callback on every logical
/// processor with entry and exit barriers.
pub trait Platform: Send + Sync {
    /// Allocate a zeroed, page-aligned, virtually-contiguous region of at
    /// least `size` bytes. Returns null on OOM.
    fn alloc(&self, size: u64) -> *mut u8;

    /// As [`Platform::alloc`], but physically contiguous.
    fn alloc_contiguous(&self, size: u64) -> *mut u8;

    /// Free a region returned by either allocator. Must accept null.
    fn free(&self, ptr: *mut u8, size: u64);

    /// Copy `dst.len()` bytes from user memory at `src`. Returns 0 on
    /// success, nonzero if the copy faulted.
    fn copy_from_user(&self, dst: &mut [u8], src: *const u8) -> i64;

    /// Translate a kernel-allocated host-virtual address to its
    /// host-physical address.
    fn virt_to_phys(&self, virt: *const u8) -> u64;

    /// Number of online logical processors.
    fn num_online_cpus(&self) -> u32;

    /// Run `f` on every logical processor in the given order, with all
    /// CPUs synchronized at a barrier on entry and exit. Every CPU is
    /// visited even after a failure; the return value is nonzero if `f`
    /// returned nonzero on any CPU.
    fn on_each_cpu(&self, order: CpuOrder, f: &mut dyn FnMut(u32) -> i64) -> i64;
}

/// Allocate `size` bytes of zeroed pages, as an owning span.
///
/// `what` names the resource for the OOM diagnostic.
pub fn alloc_pages(platform: &dyn Platform, size: u64, what: &'static str) -> Result<MutableSpan> {
    let addr = platform.alloc(size);
    if addr.is_null() {
        log::error!("platform alloc of {size:#x} bytes for {what} failed");
        return Err(Error::OutOfMemory(what));
    }
    Ok(MutableSpan { addr, size })
}

/// As [`alloc_pages`], but physically contiguous.
pub fn alloc_contiguous_pages(
    platform: &dyn Platform,
    size: u64,
    what: &'static str,
) -> Result<MutableSpan> {
    let addr = platform.alloc_contiguous(size);
    if addr.is_null() {
        log::error!("platform contiguous alloc of {size:#x} bytes for {what} failed");
        return Err(Error::OutOfMemory(what));
    }
    Ok(MutableSpan { addr, size })
}

/// Run a fallible closure on every CPU, preserving the first error raised
/// inside it.
///
/// The raw fan-out only carries an `i64` across the shim boundary; this
/// wrapper parks the first `Error` on the near side so callers see the
/// real failure kind instead of a bare status.
pub fn for_each_cpu<F>(platform: &dyn Platform, order: CpuOrder, mut f: F) -> Result<()>
where
    F: FnMut(u32) -> Result<()>,
{
    let mut first_err: Option<Error> = None;
    let ret = platform.on_each_cpu(order, &mut |cpu| match f(cpu) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("cpu {cpu}: {e}");
            if first_err.is_none() {
                first_err = Some(e);
            }
            -1
        }
    });

    match first_err {
        Some(e) => Err(e),
        // The shim can also fail without the closure having run (e.g. a
        // CPU went offline mid fan-out).
        None if ret != 0 => Err(Error::HardwareUnavailable("per-cpu fan-out failed")),
        None => Ok(()),
    }
}
