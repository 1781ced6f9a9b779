//! VMM lifecycle orchestration.
//!
//! [`Vmm`] owns everything the loader materializes for the microkernel
//! and drives the start/stop state machine over it. `start` acquires
//! resources in a fixed order — debug ring reset, root page table,
//! microkernel and extension ELF copies, staged segments, pools — then
//! maps each into the new address space and fans out the per-CPU
//! bring-up. Any failure releases the acquired prefix in reverse order;
//! a failure while rolling back the per-CPU bring-up is promoted to the
//! terminal [`VmmStatus::Corrupt`] state.

use std::sync::Arc;

use crate::args::StartArgs;
use crate::backend::{LaunchContext, VcpuBackend};
use crate::elf::{ElfFile, ElfSegments};
use crate::error::{Error, Result};
use crate::layout::{MK_HUGE_POOL_BASE_VIRT, MK_PAGE_POOL_BASE_VIRT};
use crate::mapper;
use crate::paging::RootPageTable;
use crate::platform::{for_each_cpu, CpuOrder, Platform};
use crate::pools::{alloc_mk_huge_pool, alloc_mk_page_pool, dump_pool};
use crate::ring::DebugRing;
use crate::span::MutableSpan;

/// The process-wide state of the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmStatus {
    /// Not running; a start may be attempted.
    Stopped,
    /// Every CPU is executing the microkernel in VMX root.
    Running,
    /// A teardown failed partway; terminal until process restart.
    Corrupt,
}

impl std::fmt::Display for VmmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmmStatus::Stopped => write!(f, "stopped"),
            VmmStatus::Running => write!(f, "running"),
            VmmStatus::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Everything held while the VMM runs, released in reverse order.
struct VmmResources {
    rpt: RootPageTable,
    mk_elf_file: ElfFile,
    ext_elf_files: Vec<ElfFile>,
    mk_segments: ElfSegments,
    page_pool: MutableSpan,
    huge_pool: MutableSpan,
}

impl VmmResources {
    fn release(&mut self, platform: &dyn Platform) {
        self.huge_pool.free(platform);
        self.page_pool.free(platform);
        self.mk_segments.free(platform);
        for file in self.ext_elf_files.iter_mut().rev() {
            file.free(platform);
        }
        self.mk_elf_file.free(platform);
        self.rpt.free(platform);
    }
}

/// Acquisition staging area: filled front to back, released back to
/// front on any failure, so the set released always equals the set
/// acquired so far.
#[derive(Default)]
struct Staged {
    rpt: Option<RootPageTable>,
    mk_elf_file: Option<ElfFile>,
    ext_elf_files: Vec<ElfFile>,
    mk_segments: Option<ElfSegments>,
    page_pool: Option<MutableSpan>,
    huge_pool: Option<MutableSpan>,
}

impl Staged {
    fn release(&mut self, platform: &dyn Platform) {
        if let Some(pool) = &mut self.huge_pool {
            pool.free(platform);
        }
        if let Some(pool) = &mut self.page_pool {
            pool.free(platform);
        }
        if let Some(segments) = &mut self.mk_segments {
            segments.free(platform);
        }
        for file in self.ext_elf_files.iter_mut().rev() {
            file.free(platform);
        }
        if let Some(file) = &mut self.mk_elf_file {
            file.free(platform);
        }
        if let Some(rpt) = &mut self.rpt {
            rpt.free(platform);
        }
        *self = Self::default();
    }

    fn into_resources(self) -> VmmResources {
        VmmResources {
            rpt: self.rpt.expect("staging incomplete"),
            mk_elf_file: self.mk_elf_file.expect("staging incomplete"),
            ext_elf_files: self.ext_elf_files,
            mk_segments: self.mk_segments.expect("staging incomplete"),
            page_pool: self.page_pool.expect("staging incomplete"),
            huge_pool: self.huge_pool.expect("staging incomplete"),
        }
    }
}

/// Attach the step name to a failure diagnostic.
fn step<T>(what: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        log::error!("{what} failed: {e}");
        e
    })
}

/// The loader and bring-up core, one instance per process.
pub struct Vmm {
    platform: Arc<dyn Platform>,
    backend: Box<dyn VcpuBackend>,
    status: VmmStatus,
    debug_ring: DebugRing,
    resources: Option<VmmResources>,
}

impl Vmm {
    /// Create a VMM over the given platform and per-CPU backend. The
    /// debug ring is allocated here and lives until the VMM is dropped.
    pub fn new(platform: Arc<dyn Platform>, backend: Box<dyn VcpuBackend>) -> Result<Self> {
        let debug_ring = DebugRing::alloc(&*platform)?;
        Ok(Self {
            platform,
            backend,
            status: VmmStatus::Stopped,
            debug_ring,
            resources: None,
        })
    }

    /// Create a VMM with the production VMX backend.
    pub fn with_vmx(platform: Arc<dyn Platform>) -> Result<Self> {
        let backend = Box::new(crate::backend::vmx::VmxBackend::new(platform.clone()));
        Self::new(platform, backend)
    }

    /// The current lifecycle status.
    pub fn status(&self) -> VmmStatus {
        self.status
    }

    /// The loader-side debug ring handle.
    pub fn debug_ring(&mut self) -> &mut DebugRing {
        &mut self.debug_ring
    }

    /// Copy and validate a user request, then start the VMM with it.
    pub fn start_from_user(&mut self, user_args: *const u8) -> Result<()> {
        let args = StartArgs::copy_from_user(&*self.platform, user_args)?;
        step("verify start args", args.validate())?;
        self.start(&args)
    }

    /// Start the VMM: stage every resource, build the address space, and
    /// bring every CPU up under the hypervisor.
    ///
    /// A start over a running VMM stops it first. A start over a corrupt
    /// VMM fails immediately.
    pub fn start(&mut self, args: &StartArgs) -> Result<()> {
        if self.status == VmmStatus::Running {
            log::info!("VMM already running, restarting");
            if let Err(e) = self.stop() {
                log::error!("implicit stop failed: {e}");
            }
        }

        if self.status == VmmStatus::Corrupt {
            log::error!("unable to start, previous VMM failed to properly stop");
            return Err(Error::TeardownCorruption);
        }

        let mut staged = Staged::default();
        match self.acquire_and_launch(args, &mut staged) {
            Ok(()) => {
                self.resources = Some(staged.into_resources());
                self.status = VmmStatus::Running;
                log::info!("VMM running on {} cpus", self.platform.num_online_cpus());
                Ok(())
            }
            Err(e) => {
                staged.release(&*self.platform);
                Err(e)
            }
        }
    }

    fn acquire_and_launch(&mut self, args: &StartArgs, staged: &mut Staged) -> Result<()> {
        let platform = self.platform.clone();

        self.debug_ring.reset();

        staged.rpt = Some(step(
            "alloc mk root page table",
            RootPageTable::new(&*platform),
        )?);

        staged.mk_elf_file = Some(step(
            "alloc and copy mk elf file",
            ElfFile::copy_from_user(&*platform, args.mk_elf_file),
        )?);

        for ext in args.ext_elf_files.iter().filter(|ext| !ext.is_empty()) {
            staged.ext_elf_files.push(step(
                "alloc and copy ext elf file",
                ElfFile::copy_from_user(&*platform, *ext),
            )?);
        }

        staged.mk_segments = Some(step(
            "alloc and copy mk elf segments",
            ElfSegments::stage(&*platform, staged.mk_elf_file.as_ref().unwrap()),
        )?);

        staged.page_pool = Some(step(
            "alloc mk page pool",
            alloc_mk_page_pool(&*platform, args.page_pool_size),
        )?);

        staged.huge_pool = Some(step(
            "alloc mk huge pool",
            alloc_mk_huge_pool(&*platform, 0),
        )?);

        let rpt = staged.rpt.as_mut().unwrap();

        step(
            "map mk debug ring",
            mapper::map_mk_debug_ring(rpt, &*platform, &self.debug_ring),
        )?;

        let aliases = mapper::CodeAliases::capture(&self.backend.code_alias_addrs());
        step(
            "map mk code aliases",
            mapper::map_mk_code_aliases(rpt, &*platform, &aliases),
        )?;

        step(
            "map mk elf file",
            mapper::map_mk_elf_file(rpt, &*platform, staged.mk_elf_file.as_ref().unwrap()),
        )?;

        for file in &staged.ext_elf_files {
            step(
                "map ext elf file",
                mapper::map_mk_elf_file(rpt, &*platform, file),
            )?;
        }

        step(
            "map mk elf segments",
            mapper::map_mk_elf_segments(rpt, &*platform, staged.mk_segments.as_ref().unwrap()),
        )?;

        step(
            "map mk page pool",
            mapper::map_mk_pool(
                rpt,
                &*platform,
                staged.page_pool.as_ref().unwrap(),
                MK_PAGE_POOL_BASE_VIRT,
            ),
        )?;

        step(
            "map mk huge pool",
            mapper::map_mk_pool(
                rpt,
                &*platform,
                staged.huge_pool.as_ref().unwrap(),
                MK_HUGE_POOL_BASE_VIRT,
            ),
        )?;

        let launch = LaunchContext {
            rpt_phys: rpt.root_phys(),
            mk_entry: staged.mk_segments.as_ref().unwrap().entry(),
        };

        self.dump_staged(staged);

        let backend = &mut self.backend;
        let started = step(
            "start vmm per cpu",
            for_each_cpu(&*platform, CpuOrder::Forward, |cpu| {
                backend.start_cpu(cpu, &launch)
            }),
        );

        if let Err(e) = started {
            if let Err(stop_err) = for_each_cpu(&*platform, CpuOrder::Reverse, |cpu| {
                backend.stop_cpu(cpu)
            }) {
                log::error!("stop vmm per cpu failed during rollback: {stop_err}");
                self.status = VmmStatus::Corrupt;
                return Err(Error::TeardownCorruption);
            }
            return Err(e);
        }

        Ok(())
    }

    fn dump_staged(&self, staged: &Staged) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        self.debug_ring.dump();
        if let Some(rpt) = &staged.rpt {
            rpt.dump();
        }
        if let Some(file) = &staged.mk_elf_file {
            file.dump("mk elf file");
        }
        for (idx, file) in staged.ext_elf_files.iter().enumerate() {
            file.dump(&format!("ext elf file #{idx}"));
        }
        if let Some(segments) = &staged.mk_segments {
            segments.dump();
        }
        if let Some(pool) = &staged.page_pool {
            dump_pool("mk page pool", pool);
        }
        if let Some(pool) = &staged.huge_pool {
            dump_pool("mk huge pool", pool);
        }
    }

    /// Stop the VMM: tear the per-CPU bring-up down in reverse fan-out
    /// order, then release every staged resource.
    pub fn stop(&mut self) -> Result<()> {
        match self.status {
            VmmStatus::Stopped => {
                log::debug!("VMM already stopped");
                Ok(())
            }
            VmmStatus::Corrupt => Err(Error::TeardownCorruption),
            VmmStatus::Running => {
                let platform = self.platform.clone();
                let backend = &mut self.backend;
                if let Err(e) =
                    for_each_cpu(&*platform, CpuOrder::Reverse, |cpu| backend.stop_cpu(cpu))
                {
                    log::error!("stop vmm per cpu failed: {e}");
                    self.status = VmmStatus::Corrupt;
                    return Err(Error::TeardownCorruption);
                }

                if let Some(mut resources) = self.resources.take() {
                    resources.release(&*platform);
                }
                self.status = VmmStatus::Stopped;
                log::info!("VMM stopped");
                Ok(())
            }
        }
    }
}

impl Drop for Vmm {
    fn drop(&mut self) {
        if self.status == VmmStatus::Running {
            let _ = self.stop();
        }
        let platform = self.platform.clone();
        self.debug_ring.free(&*platform);
    }
}

// Safety: the raw pointers inside Vmm's resources refer to platform
// allocations owned exclusively by this instance, and the control path
// serializes all access.
unsafe impl Send for Vmm {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testutil::small_mk_image;
    use crate::layout::{
        MAX_EXTENSIONS, MK_DEBUG_RING_BASE_VIRT, MK_HUGE_POOL_SIZE, MK_PAGE_POOL_SIZE, PAGE_SIZE,
    };
    use crate::mock::MockPlatform;
    use crate::span::Span;
    use std::sync::{Arc, Mutex};

    /// Records per-CPU calls and injects failures.
    struct FakeBackend {
        calls: Arc<Mutex<Vec<(&'static str, u32)>>>,
        fail_start_on: Option<u32>,
        fail_stop_on: Option<u32>,
        alias: u64,
    }

    impl FakeBackend {
        fn new() -> (Self, Arc<Mutex<Vec<(&'static str, u32)>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                    fail_start_on: None,
                    fail_stop_on: None,
                    alias: 0x7F00_2000_1234,
                },
                calls,
            )
        }
    }

    impl VcpuBackend for FakeBackend {
        fn start_cpu(&mut self, cpu: u32, _ctx: &LaunchContext) -> Result<()> {
            self.calls.lock().unwrap().push(("start", cpu));
            if self.fail_start_on == Some(cpu) {
                return Err(Error::VmxInstruction {
                    insn: "vmlaunch",
                    code: 5,
                });
            }
            Ok(())
        }

        fn stop_cpu(&mut self, cpu: u32) -> Result<()> {
            self.calls.lock().unwrap().push(("stop", cpu));
            if self.fail_stop_on == Some(cpu) {
                return Err(Error::VmxInstruction {
                    insn: "vmxoff",
                    code: 9,
                });
            }
            Ok(())
        }

        fn code_alias_addrs(&self) -> Vec<u64> {
            vec![self.alias]
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    struct Images {
        mk: Vec<u8>,
        ext: Vec<u8>,
    }

    impl Images {
        fn new() -> Self {
            Self {
                mk: small_mk_image(),
                ext: small_mk_image(),
            }
        }

        fn args(&self) -> StartArgs {
            let mut ext_elf_files = [Span::empty(); MAX_EXTENSIONS];
            ext_elf_files[0] = Span::new(self.ext.as_ptr(), self.ext.len() as u64);
            StartArgs {
                ver: 1,
                mk_elf_file: Span::new(self.mk.as_ptr(), self.mk.len() as u64),
                ext_elf_files,
                page_pool_size: 0,
            }
        }
    }

    fn vmm_with_fake(platform: &Arc<MockPlatform>, backend: FakeBackend) -> Vmm {
        Vmm::new(platform.clone() as Arc<dyn Platform>, Box::new(backend)).unwrap()
    }

    #[test]
    fn test_happy_start_transitions_to_running() {
        let platform = Arc::new(MockPlatform::new(2));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        vmm.start(&images.args()).unwrap();
        assert_eq!(vmm.status(), VmmStatus::Running);
        assert_eq!(&*calls.lock().unwrap(), &[("start", 0), ("start", 1)]);

        let resources = vmm.resources.as_ref().unwrap();
        let rpt = &resources.rpt;

        // Debug ring: RW, global, at its fixed base.
        let ring = rpt.lookup(MK_DEBUG_RING_BASE_VIRT).unwrap();
        assert!(ring.rw() && ring.global() && ring.nx());

        // Code alias: RX identity at the page holding the backend's
        // address, plus its successor.
        let alias = rpt.lookup(0x7F00_2000_1000).unwrap();
        assert!(!alias.nx() && !alias.rw());
        assert_eq!(alias.phys_addr(), 0x7F00_2000_1000);
        assert!(rpt.lookup(0x7F00_2000_2000).is_some());

        // Microkernel segments at their link vaddrs, attributes per flags.
        let text = rpt.lookup(0x40_0000).unwrap();
        assert!(!text.nx() && !text.rw());
        let data = rpt.lookup(0x40_2000).unwrap();
        assert!(data.nx() && data.rw());

        // Pools at their fixed bases, every page present.
        let pool_pages = MK_PAGE_POOL_SIZE / PAGE_SIZE;
        for n in [0, pool_pages / 2, pool_pages - 1] {
            let pte = rpt.lookup(MK_PAGE_POOL_BASE_VIRT + n * PAGE_SIZE).unwrap();
            assert!(pte.rw() && pte.global());
        }
        let huge_last = MK_HUGE_POOL_BASE_VIRT + MK_HUGE_POOL_SIZE - PAGE_SIZE;
        assert!(rpt.lookup(huge_last).is_some());

        vmm.stop().unwrap();
    }

    #[test]
    fn test_stop_releases_everything() {
        let platform = Arc::new(MockPlatform::new(2));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        // Baseline: the debug ring, allocated at construction.
        let baseline = platform.live_allocations();
        assert_eq!(baseline, 1);

        vmm.start(&images.args()).unwrap();
        assert!(platform.live_allocations() > baseline);

        vmm.stop().unwrap();
        assert_eq!(vmm.status(), VmmStatus::Stopped);
        assert_eq!(platform.live_allocations(), baseline);
        assert_eq!(
            &*calls.lock().unwrap(),
            &[("start", 0), ("start", 1), ("stop", 1), ("stop", 0)]
        );

        drop(vmm);
        assert_eq!(platform.live_allocations(), 0);
    }

    #[test]
    fn test_version_mismatch_leaves_status_unchanged() {
        let platform = Arc::new(MockPlatform::new(1));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        let mut args = images.args();
        args.ver = 2;

        // Through the user-copy path, as the control entry would.
        let mut raw = [0u8; StartArgs::WIRE_SIZE];
        raw[0..8].copy_from_slice(&args.ver.to_le_bytes());
        raw[8..16].copy_from_slice(&(args.mk_elf_file.addr as u64).to_le_bytes());
        raw[16..24].copy_from_slice(&args.mk_elf_file.size.to_le_bytes());
        let err = vmm.start_from_user(raw.as_ptr()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(vmm.status(), VmmStatus::Stopped);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(platform.live_allocations(), 1);
    }

    #[test]
    fn test_rollback_on_allocation_failure() {
        let platform = Arc::new(MockPlatform::new(1));
        let (backend, _calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);
        let baseline = platform.live_allocations();

        // Acquisitions run rpt, mk elf, ext elf, 2 segments, page pool,
        // then huge pool: fail the huge pool.
        platform.fail_allocation_number(7);
        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert_eq!(vmm.status(), VmmStatus::Stopped);
        assert_eq!(platform.live_allocations(), baseline);
    }

    #[test]
    fn test_rollback_on_mapping_failure() {
        let platform = Arc::new(MockPlatform::new(1));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);
        let baseline = platform.live_allocations();

        // The 8th allocation is the first page-table level for the
        // debug-ring mapping.
        platform.fail_allocation_number(8);
        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert_eq!(vmm.status(), VmmStatus::Stopped);
        assert_eq!(platform.live_allocations(), baseline);
        assert!(calls.lock().unwrap().is_empty());

        // The VMM is still startable afterwards.
        vmm.start(&images.args()).unwrap();
        assert_eq!(vmm.status(), VmmStatus::Running);
        vmm.stop().unwrap();
    }

    #[test]
    fn test_partial_cpu_failure_rolls_back_in_reverse() {
        let platform = Arc::new(MockPlatform::new(4));
        let (mut backend, calls) = FakeBackend::new();
        backend.fail_start_on = Some(2);
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);
        let baseline = platform.live_allocations();

        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(
            err,
            Error::VmxInstruction {
                insn: "vmlaunch",
                code: 5
            }
        ));

        // The fan-out visits every CPU, then unwinds in reverse.
        assert_eq!(
            &*calls.lock().unwrap(),
            &[
                ("start", 0),
                ("start", 1),
                ("start", 2),
                ("start", 3),
                ("stop", 3),
                ("stop", 2),
                ("stop", 1),
                ("stop", 0),
            ]
        );
        assert_eq!(vmm.status(), VmmStatus::Stopped);
        assert_eq!(platform.live_allocations(), baseline);
    }

    #[test]
    fn test_failed_rollback_corrupts() {
        let platform = Arc::new(MockPlatform::new(4));
        let (mut backend, _calls) = FakeBackend::new();
        backend.fail_start_on = Some(2);
        backend.fail_stop_on = Some(1);
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(err, Error::TeardownCorruption));
        assert_eq!(vmm.status(), VmmStatus::Corrupt);

        // Corrupt is terminal: further starts fail fast.
        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(err, Error::TeardownCorruption));
    }

    #[test]
    fn test_failed_stop_corrupts() {
        let platform = Arc::new(MockPlatform::new(2));
        let (mut backend, _calls) = FakeBackend::new();
        backend.fail_stop_on = Some(0);
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        vmm.start(&images.args()).unwrap();
        let err = vmm.stop().unwrap_err();
        assert!(matches!(err, Error::TeardownCorruption));
        assert_eq!(vmm.status(), VmmStatus::Corrupt);

        let err = vmm.start(&images.args()).unwrap_err();
        assert!(matches!(err, Error::TeardownCorruption));
    }

    #[test]
    fn test_restart_is_implicit_stop_then_start() {
        let platform = Arc::new(MockPlatform::new(2));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        vmm.start(&images.args()).unwrap();
        let after_first = platform.live_allocations();

        vmm.start(&images.args()).unwrap();
        assert_eq!(vmm.status(), VmmStatus::Running);
        // Same resource shape as a fresh start.
        assert_eq!(platform.live_allocations(), after_first);
        assert_eq!(
            &*calls.lock().unwrap(),
            &[
                ("start", 0),
                ("start", 1),
                ("stop", 1),
                ("stop", 0),
                ("start", 0),
                ("start", 1),
            ]
        );

        vmm.stop().unwrap();
        assert_eq!(platform.live_allocations(), 1);
    }

    #[test]
    fn test_stop_when_stopped_is_ok() {
        let platform = Arc::new(MockPlatform::new(1));
        let (backend, calls) = FakeBackend::new();
        let mut vmm = vmm_with_fake(&platform, backend);
        vmm.stop().unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_while_running_stops() {
        let platform = Arc::new(MockPlatform::new(2));
        let (backend, calls) = FakeBackend::new();
        let images = Images::new();
        let mut vmm = vmm_with_fake(&platform, backend);

        vmm.start(&images.args()).unwrap();
        drop(vmm);

        assert_eq!(platform.live_allocations(), 0);
        assert_eq!(
            &*calls.lock().unwrap(),
            &[("start", 0), ("start", 1), ("stop", 1), ("stop", 0)]
        );
    }
}
