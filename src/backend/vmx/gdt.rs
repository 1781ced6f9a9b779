//! Global descriptor table access and construction.
//!
//! Two halves:
//!
//! - Read side: reassemble a descriptor's base, limit, and attributes
//!   from a running OS's GDT, given a selector. Used to capture guest
//!   segment state. The base field is scattered across three byte groups
//!   of the 8-byte descriptor — plus, for system descriptors (the S bit
//!   clear: LDT and TSS in long mode), a fourth group in the *next*
//!   entry's low dword.
//! - Write side: build the host GDT the VMM runs with — null, ring-0
//!   code/stack/FS/GS, and a TR descriptor pointing at the host TSS.

use crate::error::{Error, Result};

const BASE_MASK1: u64 = 0x0000_0000_FFFF_0000;
const BASE_MASK2: u64 = 0x0000_00FF_0000_0000;
const BASE_MASK3: u64 = 0xFF00_0000_0000_0000;
const BASE_MASK4: u64 = 0x0000_0000_FFFF_FFFF;
const BASE_SHIFT1: u64 = 16;
// Bits 32..39 of the descriptor land at bits 16..23 of the base, so the
// shift is 16 here as well, not 32.
const BASE_SHIFT2: u64 = 16;
const BASE_SHIFT3: u64 = 32;
const BASE_SHIFT4: u64 = 32;

const LIMIT_MASK1: u64 = 0x0000_0000_0000_FFFF;
const LIMIT_MASK2: u64 = 0x000F_0000_0000_0000;
const LIMIT_SHIFT2: u64 = 32;

const ATTRIB_MASK1: u64 = 0x0000_FF00_0000_0000;
const ATTRIB_MASK2: u64 = 0x00F0_0000_0000_0000;
const ATTRIB_SHIFT1: u64 = 40;
const ATTRIB_SHIFT2: u64 = 40;

/// The S bit: clear means a 16-byte system descriptor.
const SYSTEM_BIT: u64 = 0x0000_1000_0000_0000;
/// The G bit: limit is in 4 KiB units.
const GRANULARITY_BIT: u64 = 0x0080_0000_0000_0000;

/// A GDT location as loaded into the GDTR.
#[derive(Debug, Clone, Copy)]
pub struct GdtRegister {
    /// Base of the descriptor array.
    pub base: *const u64,
    /// Size of the table in bytes, minus one.
    pub limit: u16,
}

impl GdtRegister {
    fn entries(&self) -> Result<&[u64]> {
        if self.base.is_null() {
            log::error!("GDT base is null");
            return Err(Error::InvalidArgument("GDT base is null".into()));
        }
        let count = (u64::from(self.limit) + 1) / 8;
        Ok(unsafe { std::slice::from_raw_parts(self.base, count as usize) })
    }

    fn entry_at(&self, idx: usize) -> Result<u64> {
        let entries = self.entries()?;
        entries.get(idx).copied().ok_or_else(|| {
            log::error!("GDT index {idx} is past the table limit");
            Error::InvalidArgument(format!("GDT index {idx} is out of range"))
        })
    }

    /// Reassemble the base address of the descriptor at `selector`.
    ///
    /// The null selector yields 0. System descriptors pull bits 32..63 of
    /// the base from the following entry, which must also be in bounds.
    pub fn descriptor_base(&self, selector: u16) -> Result<u64> {
        let idx = usize::from(selector >> 3);
        if idx == 0 {
            self.entries()?;
            return Ok(0);
        }
        let desc = self.entry_at(idx)?;

        let low = ((desc & BASE_MASK1) >> BASE_SHIFT1)
            | ((desc & BASE_MASK2) >> BASE_SHIFT2)
            | ((desc & BASE_MASK3) >> BASE_SHIFT3);

        if desc & SYSTEM_BIT == 0 {
            let next = self.entry_at(idx + 1)?;
            Ok(low | ((next & BASE_MASK4) << BASE_SHIFT4))
        } else {
            Ok(low)
        }
    }

    /// Reassemble the limit of the descriptor at `selector`, expanded to
    /// bytes when the granularity bit is set.
    pub fn descriptor_limit(&self, selector: u16) -> Result<u64> {
        let idx = usize::from(selector >> 3);
        if idx == 0 {
            self.entries()?;
            return Ok(0);
        }
        let desc = self.entry_at(idx)?;

        let limit = (desc & LIMIT_MASK1) | ((desc & LIMIT_MASK2) >> LIMIT_SHIFT2);
        if desc & GRANULARITY_BIT != 0 {
            Ok((limit << 12) | 0xFFF)
        } else {
            Ok(limit)
        }
    }

    /// Reassemble the attribute bits of the descriptor at `selector`:
    /// type/S/DPL/P in bits 0..7, AVL/L/DB/G in bits 12..15 — the layout
    /// the VMCS access-rights fields use.
    pub fn descriptor_attrib(&self, selector: u16) -> Result<u16> {
        let idx = usize::from(selector >> 3);
        if idx == 0 {
            self.entries()?;
            return Ok(0);
        }
        let desc = self.entry_at(idx)?;

        Ok((((desc & ATTRIB_MASK1) >> ATTRIB_SHIFT1) as u16)
            | (((desc & ATTRIB_MASK2) >> ATTRIB_SHIFT2) as u16))
    }
}

/// Attribute bytes for the host descriptors (P, ring 0, plus type).
pub mod attrib {
    /// 64-bit ring-0 code: P, S, execute/read, L.
    pub const RING0_CS: u16 = 0x209B;
    /// Ring-0 data: P, S, read/write.
    pub const RING0_DATA: u16 = 0x0093;
    /// 64-bit TSS (available): P, system type 9.
    pub const RING0_TR: u16 = 0x0089;
}

/// Number of `u64` slots in the host GDT: null, cs, ss, fs, gs, and a
/// 16-byte TR descriptor.
pub const HOST_GDT_ENTRIES: usize = 7;

/// The host GDT, built fresh for each CPU.
#[derive(Debug)]
pub struct HostGdt {
    entries: [u64; HOST_GDT_ENTRIES],
}

/// Selectors into the host GDT.
pub mod selector {
    /// Ring-0 code segment.
    pub const CS: u16 = 1 << 3;
    /// Ring-0 stack segment.
    pub const SS: u16 = 2 << 3;
    /// Ring-0 FS.
    pub const FS: u16 = 3 << 3;
    /// Ring-0 GS.
    pub const GS: u16 = 4 << 3;
    /// Task register.
    pub const TR: u16 = 5 << 3;
}

impl HostGdt {
    /// Build the host GDT. `tss_base`/`tss_limit` describe the host TSS
    /// referenced by the TR descriptor.
    pub fn new(tss_base: u64, tss_limit: u32) -> Self {
        let mut gdt = Self {
            entries: [0; HOST_GDT_ENTRIES],
        };
        gdt.set(1, 0, 0xFFFF_FFFF, attrib::RING0_CS);
        gdt.set(2, 0, 0xFFFF_FFFF, attrib::RING0_DATA);
        gdt.set(3, 0, 0xFFFF_FFFF, attrib::RING0_DATA);
        gdt.set(4, 0, 0xFFFF_FFFF, attrib::RING0_DATA);
        gdt.set_system(5, tss_base, tss_limit, attrib::RING0_TR);
        gdt
    }

    /// Encode an 8-byte descriptor into slot `idx`.
    fn set(&mut self, idx: usize, base: u64, limit: u32, attrib: u16) {
        let limit = if limit > 0xF_FFFF {
            // Switch to 4 KiB granularity for large limits.
            debug_assert_eq!(limit & 0xFFF, 0xFFF);
            return self.set_raw(idx, base, limit >> 12, attrib | 0x8000);
        } else {
            limit
        };
        self.set_raw(idx, base, limit, attrib);
    }

    fn set_raw(&mut self, idx: usize, base: u64, limit: u32, attrib: u16) {
        debug_assert!(base <= u32::MAX as u64, "8-byte descriptor base overflow");
        let mut desc = 0u64;
        desc |= u64::from(limit) & 0xFFFF;
        desc |= (base & 0xFFFF) << 16;
        desc |= ((base >> 16) & 0xFF) << 32;
        desc |= u64::from(attrib & 0x00FF) << 40;
        desc |= (u64::from(limit) & 0xF_0000) << 32;
        desc |= u64::from(attrib & 0xF000) << 40;
        desc |= ((base >> 24) & 0xFF) << 56;
        self.entries[idx] = desc;
    }

    /// Encode a 16-byte system descriptor (TSS) into slots `idx` and
    /// `idx + 1`.
    fn set_system(&mut self, idx: usize, base: u64, limit: u32, attrib: u16) {
        let mut desc = 0u64;
        desc |= u64::from(limit) & 0xFFFF;
        desc |= (base & 0xFFFF) << 16;
        desc |= ((base >> 16) & 0xFF) << 32;
        desc |= u64::from(attrib & 0x00FF) << 40;
        desc |= (u64::from(limit) & 0xF_0000) << 32;
        desc |= u64::from(attrib & 0xF000) << 40;
        desc |= ((base >> 24) & 0xFF) << 56;
        self.entries[idx] = desc;
        self.entries[idx + 1] = base >> 32;
    }

    /// A register view of this table.
    pub fn register(&self) -> GdtRegister {
        GdtRegister {
            base: self.entries.as_ptr(),
            limit: (HOST_GDT_ENTRIES * 8 - 1) as u16,
        }
    }

    /// Base address of the table.
    pub fn base(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    /// Table size in bytes, minus one.
    pub fn limit(&self) -> u16 {
        (HOST_GDT_ENTRIES * 8 - 1) as u16
    }
}
