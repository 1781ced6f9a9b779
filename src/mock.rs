//! In-process platform implementation for unit tests.
//!
//! Backs allocations with the host allocator (page-aligned and zeroed,
//! like the real shim), keeps a ledger of live allocations so tests can
//! assert the no-leak properties, and lets tests inject an OOM at the Nth
//! allocation to exercise rollback paths. Physical addresses are the
//! host-virtual addresses, which keeps `virt_to_phys` trivially
//! invertible for page-table walks.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::layout::PAGE_SIZE;
use crate::platform::{CpuOrder, Platform};

#[derive(Default)]
struct MockState {
    live: BTreeMap<usize, u64>,
    allocation_count: u64,
    fail_at: Option<u64>,
    fail_user_copy: bool,
}

/// A [`Platform`] for tests.
pub struct MockPlatform {
    cpus: u32,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// Create a mock platform reporting `cpus` online CPUs.
    pub fn new(cpus: u32) -> Self {
        Self {
            cpus,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make the `n`th allocation from now (1-based) return null.
    pub fn fail_allocation_number(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        let at = state.allocation_count + n;
        state.fail_at = Some(at);
    }

    /// Make every `copy_from_user` fault.
    pub fn fail_user_copies(&self) {
        self.state.lock().unwrap().fail_user_copy = true;
    }

    /// Number of allocations currently live.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Total allocations handed out so far.
    pub fn allocation_count(&self) -> u64 {
        self.state.lock().unwrap().allocation_count
    }

    fn layout_for(size: u64) -> Layout {
        Layout::from_size_align(size as usize, PAGE_SIZE as usize).expect("bad layout")
    }

    fn do_alloc(&self, size: u64) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        let mut state = self.state.lock().unwrap();
        state.allocation_count += 1;
        if state.fail_at == Some(state.allocation_count) {
            state.fail_at = None;
            return std::ptr::null_mut();
        }
        let ptr = unsafe { alloc_zeroed(Self::layout_for(size)) };
        if !ptr.is_null() {
            state.live.insert(ptr as usize, size);
        }
        ptr
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        for (&addr, &size) in state.live.iter() {
            unsafe { dealloc(addr as *mut u8, Self::layout_for(size)) };
        }
    }
}

impl Platform for MockPlatform {
    fn alloc(&self, size: u64) -> *mut u8 {
        self.do_alloc(size)
    }

    fn alloc_contiguous(&self, size: u64) -> *mut u8 {
        // Host allocations are "physically" contiguous under the identity
        // translation below.
        self.do_alloc(size)
    }

    fn free(&self, ptr: *mut u8, size: u64) {
        if ptr.is_null() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let tracked = state.live.remove(&(ptr as usize));
        assert_eq!(tracked, Some(size), "free of untracked or resized region");
        unsafe { dealloc(ptr, Self::layout_for(size)) };
    }

    fn copy_from_user(&self, dst: &mut [u8], src: *const u8) -> i64 {
        if self.state.lock().unwrap().fail_user_copy || src.is_null() {
            return -1;
        }
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        0
    }

    fn virt_to_phys(&self, virt: *const u8) -> u64 {
        virt as u64
    }

    fn num_online_cpus(&self) -> u32 {
        self.cpus
    }

    fn on_each_cpu(&self, order: CpuOrder, f: &mut dyn FnMut(u32) -> i64) -> i64 {
        let mut ret = 0;
        let mut run = |cpu| {
            if f(cpu) != 0 {
                ret = -1;
            }
        };
        match order {
            CpuOrder::Forward => (0..self.cpus).for_each(&mut run),
            CpuOrder::Reverse => (0..self.cpus).rev().for_each(&mut run),
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned_and_zeroed() {
        let platform = MockPlatform::new(1);
        let ptr = platform.alloc(PAGE_SIZE);
        assert!(!ptr.is_null());
        assert_eq!(ptr as u64 % PAGE_SIZE, 0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
        assert!(bytes.iter().all(|&b| b == 0));
        platform.free(ptr, PAGE_SIZE);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_fail_allocation_number() {
        let platform = MockPlatform::new(1);
        let first = platform.alloc(PAGE_SIZE);
        assert!(!first.is_null());

        platform.fail_allocation_number(2);
        let second = platform.alloc(PAGE_SIZE);
        assert!(!second.is_null());
        assert!(platform.alloc(PAGE_SIZE).is_null());

        platform.free(first, PAGE_SIZE);
        platform.free(second, PAGE_SIZE);
    }

    #[test]
    fn test_free_accepts_null() {
        let platform = MockPlatform::new(1);
        platform.free(std::ptr::null_mut(), PAGE_SIZE);
    }
}
