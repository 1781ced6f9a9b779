//! Per-CPU VMX bring-up.
//!
//! Runs on every logical processor under the platform fan-out. Each CPU
//! gets its own VMXON region, VMCS, MSR/IO bitmaps, host GDT/IDT/TSS and
//! stacks; the VMCS host state points every CPU at the microkernel entry
//! under the freshly built root page table, and guest state is captured
//! from the running OS so that VM entry resumes it transparently as
//! guest-0.
//!
//! The sequence per CPU:
//!
//! 1. read the OS's CR0/CR3/CR4, EFER, PAT, sysenter and debug MSRs,
//!    FS/GS bases, RFLAGS, selectors, GDTR/IDTR
//! 2. check CPUID features, take the IA32_FEATURE_CONTROL lock
//! 3. allocate the per-CPU regions and build host GDT/IDT/TSS
//! 4. VMXON, VMCLEAR + VMPTRLD the VMCS
//! 5. controls from the IA32_VMX_TRUE_* capability MSRs
//! 6. host state (CR3 = root page table, RIP = microkernel entry)
//! 7. guest state from the step-1 snapshot
//! 8. VMLAUNCH

pub mod gdt;
pub mod idt;
#[cfg(target_arch = "x86_64")]
pub mod support;
pub mod tss;
pub mod vmcs;

use std::sync::Arc;

use crate::backend::{LaunchContext, VcpuBackend};
use crate::error::{Error, Result};
use crate::layout::{MK_STACK_SIZE, PAGE_SIZE};
use crate::platform::{alloc_pages, Platform};
use crate::pools::alloc_mk_stack;
use crate::span::MutableSpan;

use gdt::HostGdt;
use idt::HostIdt;
use tss::TaskStateSegment;

/// Host stacks are twice the microkernel stack size.
const HOST_STACK_SIZE: u64 = 2 * MK_STACK_SIZE;

/// Whether this machine supports VMX at all.
pub fn is_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        support::detect_features().vmx
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Per-CPU state owned while that CPU runs under the hypervisor.
struct CpuContext {
    vmxon_region: MutableSpan,
    vmcs_region: MutableSpan,
    msr_bitmap: MutableSpan,
    io_bitmap_a: MutableSpan,
    io_bitmap_b: MutableSpan,
    host_stack: MutableSpan,
    nmi_stack: MutableSpan,
    // Boxed: the VMCS holds their addresses.
    tss: Box<TaskStateSegment>,
    gdt: Box<HostGdt>,
    idt: Box<HostIdt>,
}

impl CpuContext {
    fn alloc(platform: &dyn Platform) -> Result<Self> {
        let mut spans: Vec<MutableSpan> = Vec::new();
        let stack_pages = (HOST_STACK_SIZE / PAGE_SIZE) as u32;

        let acquired = (|spans: &mut Vec<MutableSpan>| -> Result<()> {
            spans.push(alloc_pages(platform, PAGE_SIZE, "vmxon region")?);
            spans.push(alloc_pages(platform, PAGE_SIZE, "vmcs region")?);
            spans.push(alloc_pages(platform, PAGE_SIZE, "msr bitmap")?);
            spans.push(alloc_pages(platform, PAGE_SIZE, "io bitmap a")?);
            spans.push(alloc_pages(platform, PAGE_SIZE, "io bitmap b")?);
            spans.push(alloc_mk_stack(platform, stack_pages)?);
            spans.push(alloc_mk_stack(platform, stack_pages)?);
            Ok(())
        })(&mut spans);

        if let Err(e) = acquired {
            for mut span in spans.into_iter().rev() {
                span.free(platform);
            }
            return Err(e);
        }

        let nmi_stack = spans.pop().unwrap();
        let host_stack = spans.pop().unwrap();
        let io_bitmap_b = spans.pop().unwrap();
        let io_bitmap_a = spans.pop().unwrap();
        let msr_bitmap = spans.pop().unwrap();
        let vmcs_region = spans.pop().unwrap();
        let vmxon_region = spans.pop().unwrap();

        let mut tss = Box::new(TaskStateSegment::new());
        tss.set_ist1(stack_top(&nmi_stack));
        let gdt = Box::new(HostGdt::new(
            &*tss as *const TaskStateSegment as u64,
            TaskStateSegment::limit(),
        ));
        let idt = Box::new(HostIdt::new(default_isr as usize as u64, gdt::selector::CS));

        Ok(Self {
            vmxon_region,
            vmcs_region,
            msr_bitmap,
            io_bitmap_a,
            io_bitmap_b,
            host_stack,
            nmi_stack,
            tss,
            gdt,
            idt,
        })
    }

    fn free(&mut self, platform: &dyn Platform) {
        self.nmi_stack.free(platform);
        self.host_stack.free(platform);
        self.io_bitmap_b.free(platform);
        self.io_bitmap_a.free(platform);
        self.msr_bitmap.free(platform);
        self.vmcs_region.free(platform);
        self.vmxon_region.free(platform);
    }
}

/// Top of a stack allocation, 16-byte aligned with a small red zone.
fn stack_top(stack: &MutableSpan) -> u64 {
    stack.addr as u64 + stack.size - 0x10
}

/// Parks a CPU that faulted while in VMX root, where an unhandled
/// exception would otherwise triple-fault with no trace.
extern "C" fn default_isr() {
    loop {
        std::hint::spin_loop();
    }
}

/// The production VMX backend.
pub struct VmxBackend {
    platform: Arc<dyn Platform>,
    cpus: Vec<Option<CpuContext>>,
}

impl VmxBackend {
    /// Create the backend for `platform`'s online CPUs.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        let count = platform.num_online_cpus() as usize;
        Self {
            platform,
            cpus: (0..count).map(|_| None).collect(),
        }
    }
}

impl VcpuBackend for VmxBackend {
    fn start_cpu(&mut self, cpu: u32, ctx: &LaunchContext) -> Result<()> {
        let slot = self
            .cpus
            .get_mut(cpu as usize)
            .ok_or(Error::HardwareUnavailable("cpu index out of range"))?;

        let mut context = CpuContext::alloc(&*self.platform)?;
        match launch(&*self.platform, cpu, ctx, &mut context) {
            Ok(()) => {
                log::debug!("cpu {cpu}: running in VMX root");
                *slot = Some(context);
                Ok(())
            }
            Err(e) => {
                context.free(&*self.platform);
                Err(e)
            }
        }
    }

    fn stop_cpu(&mut self, cpu: u32) -> Result<()> {
        let slot = self
            .cpus
            .get_mut(cpu as usize)
            .ok_or(Error::HardwareUnavailable("cpu index out of range"))?;

        // A CPU whose bring-up never completed has nothing to undo.
        let Some(mut context) = slot.take() else {
            return Ok(());
        };

        let result = teardown(&*self.platform, cpu, &context);
        context.free(&*self.platform);
        result
    }

    fn code_alias_addrs(&self) -> Vec<u64> {
        #[cfg(target_arch = "x86_64")]
        {
            // The launch path around VMLAUNCH, the instruction wrappers
            // it tail-calls into, and the fault parking routine.
            vec![
                launch as usize as u64,
                support::vmlaunch_as_guest as usize as u64,
                default_isr as usize as u64,
            ]
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            Vec::new()
        }
    }

    fn name(&self) -> &'static str {
        "vmx"
    }
}

#[cfg(target_arch = "x86_64")]
fn launch(
    platform: &dyn Platform,
    cpu: u32,
    launch_ctx: &LaunchContext,
    context: &mut CpuContext,
) -> Result<()> {
    use vmcs::bits;
    use x86::msr;
    use x86::vmx::vmcs::{control, guest};

    let features = support::detect_features();
    features.check_required()?;
    let snapshot = support::read_snapshot(&features);

    support::enable_vmx_operation()?;

    // Both regions begin with the VMCS revision identifier.
    let revision = vmcs::revision_id(support::rdmsr64(msr::IA32_VMX_BASIC));
    unsafe {
        (context.vmxon_region.addr as *mut u32).write_volatile(revision);
        (context.vmcs_region.addr as *mut u32).write_volatile(revision);
    }

    support::vmxon(platform.virt_to_phys(context.vmxon_region.addr))?;

    let result = (|| -> Result<()> {
        let vmcs_phys = platform.virt_to_phys(context.vmcs_region.addr);
        support::vmclear(vmcs_phys)?;
        support::vmptrld(vmcs_phys)?;

        // Execution controls, seeded from the TRUE capability MSRs.
        let pin =
            vmcs::ControlField::from_capability_msr(support::rdmsr64(msr::IA32_VMX_TRUE_PINBASED_CTLS));
        support::vmwrite(control::PINBASED_EXEC_CONTROLS, u64::from(pin.value()))?;

        let mut proc = vmcs::ControlField::from_capability_msr(support::rdmsr64(
            msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        ));
        proc.enable(bits::PROC_USE_MSR_BITMAP, "msr bitmap")?;
        proc.enable(bits::PROC_USE_IO_BITMAPS, "io bitmaps")?;
        proc.enable(bits::PROC_SECONDARY_CONTROLS, "secondary controls")?;
        support::vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(proc.value()))?;

        let mut proc2 = vmcs::ControlField::from_capability_msr(support::rdmsr64(
            msr::IA32_VMX_PROCBASED_CTLS2,
        ));
        if proc2.enable_if_allowed(bits::PROC2_ENABLE_VPID) {
            support::vmwrite(control::VPID, u64::from(cpu) + 1)?;
        }
        if features.rdtscp {
            proc2.enable_if_allowed(bits::PROC2_ENABLE_RDTSCP);
        }
        if features.invpcid {
            proc2.enable_if_allowed(bits::PROC2_ENABLE_INVPCID);
        }
        if features.xsaves {
            proc2.enable_if_allowed(bits::PROC2_ENABLE_XSAVES);
        }
        support::vmwrite(
            control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            u64::from(proc2.value()),
        )?;

        support::vmwrite(
            control::MSR_BITMAPS_ADDR_FULL,
            platform.virt_to_phys(context.msr_bitmap.addr),
        )?;
        support::vmwrite(
            control::IO_BITMAP_A_ADDR_FULL,
            platform.virt_to_phys(context.io_bitmap_a.addr),
        )?;
        support::vmwrite(
            control::IO_BITMAP_B_ADDR_FULL,
            platform.virt_to_phys(context.io_bitmap_b.addr),
        )?;

        let mut exit =
            vmcs::ControlField::from_capability_msr(support::rdmsr64(msr::IA32_VMX_TRUE_EXIT_CTLS));
        exit.enable(bits::EXIT_SAVE_DEBUG_CONTROLS, "save debug controls")?;
        exit.enable(bits::EXIT_HOST_ADDRESS_SPACE_SIZE, "host address-space size")?;
        exit.enable(bits::EXIT_SAVE_PAT, "save pat")?;
        exit.enable(bits::EXIT_LOAD_PAT, "load pat")?;
        exit.enable(bits::EXIT_SAVE_EFER, "save efer")?;
        exit.enable(bits::EXIT_LOAD_EFER, "load efer")?;
        if snapshot.perf_global_ctrl.is_some() {
            exit.enable_if_allowed(bits::EXIT_LOAD_PERF_GLOBAL_CTRL);
        }
        support::vmwrite(control::VMEXIT_CONTROLS, u64::from(exit.value()))?;

        let mut entry =
            vmcs::ControlField::from_capability_msr(support::rdmsr64(msr::IA32_VMX_TRUE_ENTRY_CTLS));
        entry.enable(bits::ENTRY_LOAD_DEBUG_CONTROLS, "load debug controls")?;
        entry.enable(bits::ENTRY_IA32E_MODE_GUEST, "ia-32e mode guest")?;
        entry.enable(bits::ENTRY_LOAD_PAT, "entry load pat")?;
        entry.enable(bits::ENTRY_LOAD_EFER, "entry load efer")?;
        if snapshot.perf_global_ctrl.is_some() {
            entry.enable_if_allowed(bits::ENTRY_LOAD_PERF_GLOBAL_CTRL);
        }
        support::vmwrite(control::VMENTRY_CONTROLS, u64::from(entry.value()))?;

        write_host_state(&features, launch_ctx, context)?;
        write_guest_state(&snapshot)?;

        support::vmlaunch_as_guest(guest::RSP, guest::RIP)
    })();

    if result.is_err() {
        // Leave the CPU out of VMX operation; nothing to report beyond
        // the original error.
        let _ = support::vmxoff();
    }
    result
}

#[cfg(target_arch = "x86_64")]
fn write_host_state(
    features: &vmcs::CpuFeatures,
    launch_ctx: &LaunchContext,
    context: &CpuContext,
) -> Result<()> {
    use x86::vmx::vmcs::host;

    support::vmwrite(host::CS_SELECTOR, u64::from(gdt::selector::CS))?;
    support::vmwrite(host::SS_SELECTOR, u64::from(gdt::selector::SS))?;
    support::vmwrite(host::DS_SELECTOR, 0)?;
    support::vmwrite(host::ES_SELECTOR, 0)?;
    support::vmwrite(host::FS_SELECTOR, u64::from(gdt::selector::FS))?;
    support::vmwrite(host::GS_SELECTOR, u64::from(gdt::selector::GS))?;
    support::vmwrite(host::TR_SELECTOR, u64::from(gdt::selector::TR))?;

    support::vmwrite(host::IA32_PAT_FULL, support::rdmsr64(x86::msr::IA32_PAT))?;
    support::vmwrite(host::IA32_EFER_FULL, features.host_efer())?;

    support::vmwrite(host::CR0, features.host_cr0())?;
    support::vmwrite(host::CR3, launch_ctx.rpt_phys)?;
    support::vmwrite(host::CR4, features.host_cr4())?;

    support::vmwrite(host::FS_BASE, 0)?;
    support::vmwrite(host::GS_BASE, 0)?;
    support::vmwrite(host::TR_BASE, &*context.tss as *const _ as u64)?;
    support::vmwrite(host::GDTR_BASE, context.gdt.base())?;
    support::vmwrite(host::IDTR_BASE, context.idt.base())?;

    support::vmwrite(host::IA32_SYSENTER_CS, 0)?;
    support::vmwrite(host::IA32_SYSENTER_ESP, 0)?;
    support::vmwrite(host::IA32_SYSENTER_EIP, 0)?;

    support::vmwrite(host::RIP, launch_ctx.mk_entry)?;
    support::vmwrite(host::RSP, stack_top(&context.host_stack))?;
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn write_guest_state(snapshot: &vmcs::CpuSnapshot) -> Result<()> {
    use x86::vmx::vmcs::guest;

    let gdtr = gdt::GdtRegister {
        base: snapshot.gdtr.base as *const u64,
        limit: snapshot.gdtr.limit,
    };
    let sel = &snapshot.selectors;

    support::vmwrite(guest::ES_SELECTOR, u64::from(sel.es))?;
    support::vmwrite(guest::CS_SELECTOR, u64::from(sel.cs))?;
    support::vmwrite(guest::SS_SELECTOR, u64::from(sel.ss))?;
    support::vmwrite(guest::DS_SELECTOR, u64::from(sel.ds))?;
    support::vmwrite(guest::FS_SELECTOR, u64::from(sel.fs))?;
    support::vmwrite(guest::GS_SELECTOR, u64::from(sel.gs))?;
    support::vmwrite(guest::LDTR_SELECTOR, u64::from(sel.ldtr))?;
    support::vmwrite(guest::TR_SELECTOR, u64::from(sel.tr))?;

    support::vmwrite(guest::IA32_DEBUGCTL_FULL, snapshot.debugctl)?;
    support::vmwrite(guest::IA32_PAT_FULL, snapshot.pat)?;
    support::vmwrite(guest::IA32_EFER_FULL, snapshot.efer)?;
    if let Some(perf) = snapshot.perf_global_ctrl {
        support::vmwrite(guest::IA32_PERF_GLOBAL_CTRL_FULL, perf)?;
    }
    support::vmwrite(guest::LINK_PTR_FULL, u64::MAX)?;

    support::vmwrite(guest::GDTR_LIMIT, u64::from(snapshot.gdtr.limit))?;
    support::vmwrite(guest::IDTR_LIMIT, u64::from(snapshot.idtr.limit))?;
    support::vmwrite(guest::GDTR_BASE, snapshot.gdtr.base)?;
    support::vmwrite(guest::IDTR_BASE, snapshot.idtr.base)?;

    let segments = [
        (guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS, guest::ES_BASE, sel.es),
        (guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS, guest::CS_BASE, sel.cs),
        (guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS, guest::SS_BASE, sel.ss),
        (guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS, guest::DS_BASE, sel.ds),
        (guest::LDTR_LIMIT, guest::LDTR_ACCESS_RIGHTS, guest::LDTR_BASE, sel.ldtr),
    ];
    for (limit_field, ar_field, base_field, selector) in segments {
        let (limit, attrib, base) = read_descriptor(&gdtr, selector)?;
        support::vmwrite(limit_field, limit)?;
        support::vmwrite(ar_field, u64::from(vmcs::segment_access_rights(selector, attrib)))?;
        support::vmwrite(base_field, base)?;
    }

    // FS/GS take their bases from the MSRs, not the descriptors.
    let (fs_limit, fs_attrib, _) = read_descriptor(&gdtr, sel.fs)?;
    support::vmwrite(guest::FS_LIMIT, fs_limit)?;
    support::vmwrite(
        guest::FS_ACCESS_RIGHTS,
        u64::from(vmcs::segment_access_rights(sel.fs, fs_attrib)),
    )?;
    support::vmwrite(guest::FS_BASE, snapshot.fs_base)?;

    let (gs_limit, gs_attrib, _) = read_descriptor(&gdtr, sel.gs)?;
    support::vmwrite(guest::GS_LIMIT, gs_limit)?;
    support::vmwrite(
        guest::GS_ACCESS_RIGHTS,
        u64::from(vmcs::segment_access_rights(sel.gs, gs_attrib)),
    )?;
    support::vmwrite(guest::GS_BASE, snapshot.gs_base)?;

    let (tr_limit, tr_attrib, tr_base) = read_descriptor(&gdtr, sel.tr)?;
    support::vmwrite(guest::TR_LIMIT, tr_limit)?;
    support::vmwrite(
        guest::TR_ACCESS_RIGHTS,
        u64::from(vmcs::tr_access_rights(sel.tr, tr_attrib)),
    )?;
    support::vmwrite(guest::TR_BASE, tr_base)?;

    support::vmwrite(guest::CR0, snapshot.cr0)?;
    support::vmwrite(guest::CR3, snapshot.cr3)?;
    support::vmwrite(guest::CR4, snapshot.cr4)?;
    support::vmwrite(guest::DR7, snapshot.dr7)?;
    support::vmwrite(guest::RFLAGS, snapshot.rflags)?;

    support::vmwrite(guest::IA32_SYSENTER_CS, snapshot.sysenter_cs)?;
    support::vmwrite(guest::IA32_SYSENTER_ESP, snapshot.sysenter_esp)?;
    support::vmwrite(guest::IA32_SYSENTER_EIP, snapshot.sysenter_eip)?;
    Ok(())
}

/// (limit, attrib, base) of `selector` in the guest GDT; zeros for the
/// null selector.
#[cfg(target_arch = "x86_64")]
fn read_descriptor(gdtr: &gdt::GdtRegister, selector: u16) -> Result<(u64, u16, u64)> {
    if selector >> 3 == 0 {
        return Ok((0, 0, 0));
    }
    Ok((
        gdtr.descriptor_limit(selector)?,
        gdtr.descriptor_attrib(selector)?,
        gdtr.descriptor_base(selector)?,
    ))
}

#[cfg(target_arch = "x86_64")]
fn teardown(platform: &dyn Platform, cpu: u32, context: &CpuContext) -> Result<()> {
    // Drop the VMCS from the processor before leaving VMX operation.
    support::vmclear(platform.virt_to_phys(context.vmcs_region.addr))?;
    support::vmxoff()?;
    log::debug!("cpu {cpu}: left VMX root");
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn launch(
    _platform: &dyn Platform,
    _cpu: u32,
    _launch_ctx: &LaunchContext,
    _context: &mut CpuContext,
) -> Result<()> {
    Err(Error::HardwareUnavailable("VMX requires an x86-64 CPU"))
}

#[cfg(not(target_arch = "x86_64"))]
fn teardown(_platform: &dyn Platform, _cpu: u32, _context: &CpuContext) -> Result<()> {
    Ok(())
}
