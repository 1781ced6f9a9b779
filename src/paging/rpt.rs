//! Root page table builder.
//!
//! Builds the microkernel's 4-level address space (PML4 → PDPT → PD → PT,
//! 512 entries of 8 bytes per level) from scratch. Missing intermediate
//! tables are allocated on demand with `p=1, rw=1, us=0` and marked
//! `auto_release`; leaves carry the caller's attributes. Only 4 KiB
//! leaves are ever emitted — the microkernel may promote to large pages
//! at runtime, the loader never does.
//!
//! The builder keeps a phys→page registry of every page it allocates, so
//! teardown can run the depth-first walk without a phys-to-virt service
//! from the platform.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;
use crate::paging::pte::Pte;
use crate::platform::{alloc_pages, Platform};
use crate::span::MutableSpan;

const ENTRIES: u64 = 512;
const LEVELS: u32 = 4;

/// Attributes for a leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAttr {
    /// Read-only, no-execute.
    ReadOnly,
    /// Read/write, no-execute.
    ReadWrite,
    /// Read/execute.
    ReadExecute,
    /// Read-only, no-execute, global.
    ReadOnlyGlobal,
    /// Read/write, no-execute, global.
    ReadWriteGlobal,
}

impl PageAttr {
    fn writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteGlobal)
    }

    fn executable(self) -> bool {
        matches!(self, Self::ReadExecute)
    }

    fn global(self) -> bool {
        matches!(self, Self::ReadOnlyGlobal | Self::ReadWriteGlobal)
    }
}

/// The microkernel's root page table.
#[derive(Debug)]
pub struct RootPageTable {
    pml4: MutableSpan,
    pml4_phys: u64,
    /// Every page this table allocated (intermediate tables today),
    /// keyed by physical address.
    owned: BTreeMap<u64, MutableSpan>,
}

impl RootPageTable {
    /// Allocate an empty table (one zeroed PML4 page).
    pub fn new(platform: &dyn Platform) -> Result<Self> {
        let pml4 = alloc_pages(platform, PAGE_SIZE, "root page table")?;
        let pml4_phys = platform.virt_to_phys(pml4.addr);
        Ok(Self {
            pml4,
            pml4_phys,
            owned: BTreeMap::new(),
        })
    }

    /// Physical address of the PML4 page (the value loaded into CR3).
    pub fn root_phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Map one 4 KiB page at `virt` to the frame at `phys`.
    ///
    /// Both addresses must be page aligned. Re-mapping an already-present
    /// leaf is a [`Error::MappingConflict`]; callers never double-map.
    pub fn map(
        &mut self,
        platform: &dyn Platform,
        virt: u64,
        phys: u64,
        attr: PageAttr,
    ) -> Result<()> {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "map of unaligned address: virt 0x{virt:x} phys 0x{phys:x}"
            )));
        }

        let mut table = self.pml4.addr as *mut u64;
        for level in (2..=LEVELS).rev() {
            let idx = Self::index_at(virt, level);
            table = self.walk_or_alloc(platform, table, idx)?;
        }

        let idx = Self::index_at(virt, 1);
        let slot = unsafe { table.add(idx as usize) };
        if Pte::from_raw(unsafe { slot.read() }).present() {
            log::error!("virtual address 0x{virt:016x} is already mapped");
            return Err(Error::MappingConflict { virt });
        }

        let mut pte = Pte::zero();
        pte.set_present(true)
            .set_rw(attr.writable())
            .set_us(false)
            .set_global(attr.global())
            .set_nx(!attr.executable())
            .set_phys_addr(phys);
        unsafe { slot.write(pte.raw()) };
        Ok(())
    }

    /// Walk the tree for `virt` and return the leaf entry, if any.
    pub fn lookup(&self, virt: u64) -> Option<Pte> {
        let mut table = self.pml4.addr as *const u64;
        for level in (2..=LEVELS).rev() {
            let idx = Self::index_at(virt, level);
            let entry = Pte::from_raw(unsafe { table.add(idx as usize).read() });
            if !entry.present() {
                return None;
            }
            table = self.owned.get(&entry.phys_addr())?.addr as *const u64;
        }

        let entry = Pte::from_raw(unsafe {
            table.add(Self::index_at(virt, 1) as usize).read()
        });
        entry.present().then_some(entry)
    }

    /// Release the whole tree: depth-first, freeing auto-release leaf
    /// frames, then each intermediate table, then the PML4 page itself.
    pub fn free(&mut self, platform: &dyn Platform) {
        if self.pml4.is_empty() {
            return;
        }
        self.free_table(platform, self.pml4.addr as *const u64, LEVELS);
        self.pml4.free(platform);
        self.pml4_phys = 0;
        debug_assert!(self.owned.is_empty(), "leaked page table pages");
    }

    fn free_table(&mut self, platform: &dyn Platform, table: *const u64, level: u32) {
        for idx in 0..ENTRIES {
            let entry = Pte::from_raw(unsafe { table.add(idx as usize).read() });
            if !entry.present() {
                continue;
            }
            if level == 1 {
                if entry.auto_release() {
                    self.free_owned(platform, entry.phys_addr());
                }
                continue;
            }
            let child_phys = entry.phys_addr();
            if let Some(child) = self.owned.get(&child_phys) {
                let child_addr = child.addr as *const u64;
                self.free_table(platform, child_addr, level - 1);
            }
            self.free_owned(platform, child_phys);
        }
    }

    fn free_owned(&mut self, platform: &dyn Platform, phys: u64) {
        if let Some(mut page) = self.owned.remove(&phys) {
            page.free(platform);
        }
    }

    /// Number of pages the table currently owns (PML4 excluded).
    pub fn owned_pages(&self) -> usize {
        self.owned.len()
    }

    /// Log a summary of the tree.
    pub fn dump(&self) {
        log::debug!(
            "root page table: pml4 phys 0x{:016x}, {} owned table pages",
            self.pml4_phys,
            self.owned.len()
        );
    }

    fn index_at(virt: u64, level: u32) -> u64 {
        (virt >> (12 + 9 * (level - 1))) & (ENTRIES - 1)
    }

    fn walk_or_alloc(
        &mut self,
        platform: &dyn Platform,
        table: *mut u64,
        idx: u64,
    ) -> Result<*mut u64> {
        let slot = unsafe { table.add(idx as usize) };
        let entry = Pte::from_raw(unsafe { slot.read() });

        if entry.present() {
            let child = self
                .owned
                .get(&entry.phys_addr())
                .expect("present non-leaf entry references an unowned table");
            return Ok(child.addr as *mut u64);
        }

        let page = alloc_pages(platform, PAGE_SIZE, "page table level")?;
        let phys = platform.virt_to_phys(page.addr);
        let addr = page.addr;

        let mut pte = Pte::zero();
        pte.set_present(true)
            .set_rw(true)
            .set_us(false)
            .set_auto_release(true)
            .set_phys_addr(phys);
        unsafe { slot.write(pte.raw()) };

        self.owned.insert(phys, page);
        Ok(addr as *mut u64)
    }
}
