//! Per-resource mapping into the microkernel's address space.
//!
//! Each `map_*` operation walks one staged resource page by page and
//! installs leaves with that resource's attributes:
//!
//! - debug ring: RW, global, at its fixed virtual base
//! - code aliases: identity RX at the loader's own host-virtual addresses
//! - ELF images: RO at the loader's host-virtual addresses
//! - ELF segments: at link vaddrs, RX / RW / RO chosen from `p_flags`
//! - pools: RW, global, at their fixed virtual bases
//!
//! Physical frames come from `virt_to_phys`; the frames stay owned by
//! their resource objects, so no leaf is marked auto-release.

use crate::elf::{ElfFile, ElfSegments};
use crate::error::Result;
use crate::layout::{align_up, PAGE_SIZE};
use crate::paging::{PageAttr, RootPageTable};
use crate::platform::Platform;
use crate::ring::DebugRing;
use crate::span::MutableSpan;

/// Map `size` bytes starting at host-virtual `addr` to `virt`, page by
/// page, translating each page through the platform.
fn map_region(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    virt: u64,
    addr: *const u8,
    size: u64,
    attr: PageAttr,
) -> Result<()> {
    let mut offset = 0;
    while offset < size {
        let page = unsafe { addr.add(offset as usize) };
        let phys = platform.virt_to_phys(page);
        rpt.map(platform, virt + offset, phys, attr)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

/// M1: map the debug ring read/write at its fixed base.
pub fn map_mk_debug_ring(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    ring: &DebugRing,
) -> Result<()> {
    map_region(
        rpt,
        platform,
        crate::layout::MK_DEBUG_RING_BASE_VIRT,
        ring.addr(),
        ring.size(),
        PageAttr::ReadWriteGlobal,
    )
}

/// The loader code pages that must stay fetchable across the CR3 switch.
///
/// Captured from the addresses of the functions the CPU may be executing
/// while the switch retires; each alias covers the containing page and
/// its successor so a function straddling a boundary stays covered.
#[derive(Debug, Default)]
pub struct CodeAliases {
    pages: Vec<u64>,
}

impl CodeAliases {
    /// Build the alias set from a list of code addresses.
    pub fn capture(addrs: &[u64]) -> Self {
        let mut pages: Vec<u64> = addrs
            .iter()
            .flat_map(|&addr| {
                let page = addr & !(PAGE_SIZE - 1);
                [page, page + PAGE_SIZE]
            })
            .collect();
        pages.sort_unstable();
        pages.dedup();
        Self { pages }
    }

    /// The host-virtual pages in the alias set.
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }
}

/// M2: identity-map the loader's own code pages, read/execute.
///
/// The retired `mov cr3` still fetches its successor instructions through
/// the new root; without these aliases that fetch faults.
pub fn map_mk_code_aliases(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    aliases: &CodeAliases,
) -> Result<()> {
    for &page in aliases.pages() {
        let phys = platform.virt_to_phys(page as *const u8);
        rpt.map(platform, page, phys, PageAttr::ReadExecute)?;
    }
    Ok(())
}

/// M3/M4: map a copied ELF image read-only at its host-virtual address.
pub fn map_mk_elf_file(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    file: &ElfFile,
) -> Result<()> {
    map_region(
        rpt,
        platform,
        file.addr() as u64,
        file.addr(),
        file.size(),
        PageAttr::ReadOnly,
    )
}

/// M5: map every staged segment at its link-time vaddr with attributes
/// from its ELF flags.
pub fn map_mk_elf_segments(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    segments: &ElfSegments,
) -> Result<()> {
    for segment in segments.segments() {
        let attr = if segment.executable() {
            PageAttr::ReadExecute
        } else if segment.writable() {
            PageAttr::ReadWrite
        } else {
            PageAttr::ReadOnly
        };
        map_region(
            rpt,
            platform,
            segment.vaddr,
            segment.pages.addr,
            align_up(segment.memsz, PAGE_SIZE),
            attr,
        )?;
    }
    Ok(())
}

/// M6/M7: map a pool read/write at its fixed virtual base.
pub fn map_mk_pool(
    rpt: &mut RootPageTable,
    platform: &dyn Platform,
    pool: &MutableSpan,
    base_virt: u64,
) -> Result<()> {
    map_region(
        rpt,
        platform,
        base_virt,
        pool.addr,
        pool.size,
        PageAttr::ReadWriteGlobal,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testutil::small_mk_image;
    use crate::layout::{MK_DEBUG_RING_BASE_VIRT, MK_PAGE_POOL_BASE_VIRT};
    use crate::mock::MockPlatform;
    use crate::platform::alloc_pages;
    use crate::span::Span;

    #[test]
    fn test_debug_ring_maps_rw_global_at_base() {
        let platform = MockPlatform::new(1);
        let mut rpt = RootPageTable::new(&platform).unwrap();
        let mut ring = DebugRing::alloc(&platform).unwrap();

        map_mk_debug_ring(&mut rpt, &platform, &ring).unwrap();

        let pte = rpt.lookup(MK_DEBUG_RING_BASE_VIRT).unwrap();
        assert!(pte.rw());
        assert!(pte.global());
        assert!(pte.nx());
        assert_eq!(pte.phys_addr(), platform.virt_to_phys(ring.addr()));

        // Last page of the ring is mapped too.
        let last = MK_DEBUG_RING_BASE_VIRT + ring.size() - PAGE_SIZE;
        assert!(rpt.lookup(last).is_some());
        assert!(rpt.lookup(last + PAGE_SIZE).is_none());

        rpt.free(&platform);
        ring.free(&platform);
    }

    #[test]
    fn test_code_aliases_identity_map_rx() {
        let platform = MockPlatform::new(1);
        let mut rpt = RootPageTable::new(&platform).unwrap();

        let marker = test_code_aliases_identity_map_rx as *const () as u64;
        let aliases = CodeAliases::capture(&[marker]);
        assert_eq!(aliases.pages().len(), 2);

        map_mk_code_aliases(&mut rpt, &platform, &aliases).unwrap();

        let page = marker & !(PAGE_SIZE - 1);
        let pte = rpt.lookup(page).unwrap();
        assert!(!pte.nx());
        assert!(!pte.rw());
        // Identity under the mock's virt == phys translation.
        assert_eq!(pte.phys_addr(), page);

        rpt.free(&platform);
    }

    #[test]
    fn test_code_aliases_dedup_shared_pages() {
        let aliases = CodeAliases::capture(&[0x10010, 0x10020, 0x11008]);
        // 0x10000/0x11000 shared, plus 0x12000.
        assert_eq!(aliases.pages(), &[0x10000, 0x11000, 0x12000]);
    }

    #[test]
    fn test_elf_file_maps_read_only() {
        let platform = MockPlatform::new(1);
        let mut rpt = RootPageTable::new(&platform).unwrap();
        let image = small_mk_image();
        let mut file =
            ElfFile::copy_from_user(&platform, Span::new(image.as_ptr(), image.len() as u64))
                .unwrap();

        map_mk_elf_file(&mut rpt, &platform, &file).unwrap();

        let pte = rpt.lookup(file.addr() as u64).unwrap();
        assert!(!pte.rw());
        assert!(pte.nx());

        rpt.free(&platform);
        file.free(&platform);
    }

    #[test]
    fn test_segments_map_at_link_vaddrs_with_flag_attrs() {
        let platform = MockPlatform::new(1);
        let mut rpt = RootPageTable::new(&platform).unwrap();
        let image = small_mk_image();
        let mut file =
            ElfFile::copy_from_user(&platform, Span::new(image.as_ptr(), image.len() as u64))
                .unwrap();
        let mut segments = ElfSegments::stage(&platform, &file).unwrap();

        map_mk_elf_segments(&mut rpt, &platform, &segments).unwrap();

        // Text: RX at its link address.
        let text = rpt.lookup(0x40_0000).unwrap();
        assert!(!text.nx());
        assert!(!text.rw());

        // Data: RW + NX, spanning its full memsz (2 pages).
        let data = rpt.lookup(0x40_2000).unwrap();
        assert!(data.nx());
        assert!(data.rw());
        assert!(rpt.lookup(0x40_3000).is_some());
        assert!(rpt.lookup(0x40_4000).is_none());

        rpt.free(&platform);
        segments.free(&platform);
        file.free(&platform);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_pool_maps_every_page_at_fixed_base() {
        let platform = MockPlatform::new(1);
        let mut rpt = RootPageTable::new(&platform).unwrap();
        let mut pool = alloc_pages(&platform, 4 * PAGE_SIZE, "pool").unwrap();

        map_mk_pool(&mut rpt, &platform, &pool, MK_PAGE_POOL_BASE_VIRT).unwrap();

        for n in 0..4u64 {
            let pte = rpt.lookup(MK_PAGE_POOL_BASE_VIRT + n * PAGE_SIZE).unwrap();
            assert!(pte.rw());
            assert!(pte.global());
            assert_eq!(
                pte.phys_addr(),
                platform.virt_to_phys(unsafe { pool.addr.add((n * PAGE_SIZE) as usize) })
            );
        }

        rpt.free(&platform);
        pool.free(&platform);
    }
}
