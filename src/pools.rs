//! Resource pools handed to the microkernel.
//!
//! All three allocators take a size in pages, not bytes, and substitute a
//! build-time default when given zero. The page pool and stacks only need
//! virtual contiguity (the mapper faults each page in individually); the
//! huge pool must be physically contiguous because the microkernel carves
//! large DMA-style buffers out of it.

use crate::error::Result;
use crate::layout::{MK_HUGE_POOL_SIZE, MK_PAGE_POOL_SIZE, MK_STACK_SIZE, PAGE_SIZE};
use crate::platform::{alloc_contiguous_pages, alloc_pages, Platform};
use crate::span::MutableSpan;

fn bytes_or_default(pages: u32, default_bytes: u64) -> u64 {
    if pages == 0 {
        default_bytes
    } else {
        PAGE_SIZE * u64::from(pages)
    }
}

/// Allocate the microkernel's page pool.
pub fn alloc_mk_page_pool(platform: &dyn Platform, pages: u32) -> Result<MutableSpan> {
    alloc_pages(
        platform,
        bytes_or_default(pages, MK_PAGE_POOL_SIZE),
        "page pool",
    )
}

/// Allocate the microkernel's physically contiguous huge pool.
pub fn alloc_mk_huge_pool(platform: &dyn Platform, pages: u32) -> Result<MutableSpan> {
    alloc_contiguous_pages(
        platform,
        bytes_or_default(pages, MK_HUGE_POOL_SIZE),
        "huge pool",
    )
}

/// Allocate a stack for the microkernel or the per-CPU host context.
pub fn alloc_mk_stack(platform: &dyn Platform, pages: u32) -> Result<MutableSpan> {
    alloc_pages(platform, bytes_or_default(pages, MK_STACK_SIZE), "stack")
}

/// Log a pool's location.
pub fn dump_pool(name: &str, pool: &MutableSpan) {
    log::debug!("{name}: addr {:p} size 0x{:x}", pool.addr, pool.size);
}
