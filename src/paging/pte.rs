//! Page table entry layout.
//!
//! The 64-bit entry is ABI with the microkernel, so every field lives at
//! an exact bit position:
//!
//! ```text
//! bit  0        p             present
//! bit  1        rw            read/write
//! bit  2        us            user/supervisor
//! bit  3        pwt           page-level writethrough
//! bit  4        pcd           page-level cache disable
//! bit  5        a             accessed
//! bit  6        d             dirty
//! bit  7        pat           page-attribute table
//! bit  8        g             global
//! bits 9..12    avl           available to software
//! bits 12..52   phys          physical frame (bits 12..51 of the address)
//! bits 52..59   auto_release  loader-private: free the frame at teardown
//! bits 59..63   mpk           memory protection key
//! bit  63       nx            no-execute
//! ```
//!
//! `auto_release` sits in the architecturally-ignored region, so hardware
//! never sees it; the loader and microkernel agree it marks frames the
//! paging code owns.

/// A 64-bit page table entry at any paging level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

const _: () = assert!(std::mem::size_of::<Pte>() == 8);

const PHYS_SHIFT: u64 = 12;
const PHYS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const AVL_SHIFT: u64 = 9;
const AVL_MASK: u64 = 0x7 << AVL_SHIFT;
const AUTO_RELEASE_SHIFT: u64 = 52;
const AUTO_RELEASE_MASK: u64 = 0x7F << AUTO_RELEASE_SHIFT;
const MPK_SHIFT: u64 = 59;
const MPK_MASK: u64 = 0xF << MPK_SHIFT;

impl Pte {
    /// The zero (non-present) entry.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Wrap a raw entry value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw entry value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn bit(self, n: u64) -> bool {
        self.0 & (1 << n) != 0
    }

    fn set_bit(&mut self, n: u64, enabled: bool) -> &mut Self {
        if enabled {
            self.0 |= 1 << n;
        } else {
            self.0 &= !(1 << n);
        }
        self
    }

    /// Present.
    pub fn present(self) -> bool {
        self.bit(0)
    }

    /// Set the present bit.
    pub fn set_present(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(0, enabled)
    }

    /// Read/write.
    pub fn rw(self) -> bool {
        self.bit(1)
    }

    /// Set the read/write bit.
    pub fn set_rw(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(1, enabled)
    }

    /// User/supervisor.
    pub fn us(self) -> bool {
        self.bit(2)
    }

    /// Set the user/supervisor bit.
    pub fn set_us(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(2, enabled)
    }

    /// Page-level writethrough.
    pub fn pwt(self) -> bool {
        self.bit(3)
    }

    /// Set the page-level writethrough bit.
    pub fn set_pwt(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(3, enabled)
    }

    /// Page-level cache disable.
    pub fn pcd(self) -> bool {
        self.bit(4)
    }

    /// Set the page-level cache disable bit.
    pub fn set_pcd(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(4, enabled)
    }

    /// Accessed.
    pub fn accessed(self) -> bool {
        self.bit(5)
    }

    /// Dirty.
    pub fn dirty(self) -> bool {
        self.bit(6)
    }

    /// Page-attribute table.
    pub fn pat(self) -> bool {
        self.bit(7)
    }

    /// Global.
    pub fn global(self) -> bool {
        self.bit(8)
    }

    /// Set the global bit.
    pub fn set_global(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(8, enabled)
    }

    /// The available-to-software field (3 bits).
    pub fn avl(self) -> u64 {
        (self.0 & AVL_MASK) >> AVL_SHIFT
    }

    /// The physical address of the referenced frame (already shifted).
    pub fn phys_addr(self) -> u64 {
        self.0 & PHYS_MASK
    }

    /// Set the physical address of the referenced frame. `addr` must be
    /// 4 KiB aligned.
    pub fn set_phys_addr(&mut self, addr: u64) -> &mut Self {
        debug_assert_eq!(addr & !PHYS_MASK, 0, "unaligned or oversized frame address");
        self.0 = (self.0 & !PHYS_MASK) | (addr & PHYS_MASK);
        self
    }

    /// The loader-private auto-release field.
    pub fn auto_release(self) -> bool {
        self.0 & AUTO_RELEASE_MASK != 0
    }

    /// Mark whether the loader owns the referenced frame.
    pub fn set_auto_release(&mut self, enabled: bool) -> &mut Self {
        self.0 &= !AUTO_RELEASE_MASK;
        if enabled {
            self.0 |= 1 << AUTO_RELEASE_SHIFT;
        }
        self
    }

    /// The memory protection key field (4 bits).
    pub fn mpk(self) -> u64 {
        (self.0 & MPK_MASK) >> MPK_SHIFT
    }

    /// No-execute.
    pub fn nx(self) -> bool {
        self.bit(63)
    }

    /// Set the no-execute bit.
    pub fn set_nx(&mut self, enabled: bool) -> &mut Self {
        self.set_bit(63, enabled)
    }
}
