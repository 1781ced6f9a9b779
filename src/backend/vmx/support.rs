//! Raw hardware access for the VMX engine.
//!
//! Thin unsafe wrappers over the `x86` crate plus the handful of reads it
//! does not expose. Everything here requires ring 0 on an x86-64 CPU;
//! nothing here computes — the math lives in [`super::vmcs`].

use core::arch::asm;

use x86::bits64::vmx;
use x86::controlregs::{self, Cr4};
use x86::cpuid::CpuId;
use x86::dtables::{self, DescriptorTablePointer};
use x86::msr::{self, rdmsr, wrmsr};
use x86::vmx::VmFail;

use crate::backend::vmx::vmcs::{CpuFeatures, CpuSnapshot, Selectors, TablePointer};
use crate::error::{Error, Result};

/// Not exposed by the `x86` msr module in this crate version.
const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;

const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;

/// Query the CPUID feature bits the bring-up consults.
pub fn detect_features() -> CpuFeatures {
    let cpuid = CpuId::new();

    let info = cpuid.get_feature_info();
    let extended = cpuid.get_extended_feature_info();
    let proc_ext = cpuid.get_extended_processor_and_feature_identifiers();
    let state = cpuid.get_extended_state_info();
    let perf = cpuid.get_performance_monitoring_info();

    CpuFeatures {
        vmx: info.as_ref().map_or(false, |f| f.has_vmx()),
        lme: proc_ext.as_ref().map_or(false, |f| f.has_64bit_mode()),
        nx: proc_ext.as_ref().map_or(false, |f| f.has_execute_disable()),
        xsave: info.as_ref().map_or(false, |f| f.has_xsave()),
        smep: extended.as_ref().map_or(false, |f| f.has_smep()),
        smap: extended.as_ref().map_or(false, |f| f.has_smap()),
        invpcid: extended.as_ref().map_or(false, |f| f.has_invpcid()),
        rdtscp: proc_ext.as_ref().map_or(false, |f| f.has_rdtscp()),
        xsaves: state.as_ref().map_or(false, |s| s.has_xsaves_xrstors()),
        perf_version: perf.as_ref().map_or(0, |p| p.version_id()),
    }
}

/// Read an MSR.
pub fn rdmsr64(which: u32) -> u64 {
    unsafe { rdmsr(which) }
}

/// Capture the running OS's register state on this CPU.
pub fn read_snapshot(features: &CpuFeatures) -> CpuSnapshot {
    let mut gdtr = DescriptorTablePointer::<u64> {
        limit: 0,
        base: core::ptr::null(),
    };
    let mut idtr = DescriptorTablePointer::<u64> {
        limit: 0,
        base: core::ptr::null(),
    };
    unsafe {
        dtables::sgdt(&mut gdtr);
        dtables::sidt(&mut idtr);
    }

    let perf_global_ctrl = if features.perf_version >= 2 {
        Some(unsafe { rdmsr(IA32_PERF_GLOBAL_CTRL) })
    } else {
        None
    };

    unsafe {
        CpuSnapshot {
            cr0: controlregs::cr0().bits() as u64,
            cr3: controlregs::cr3(),
            cr4: controlregs::cr4().bits() as u64,
            efer: rdmsr(msr::IA32_EFER),
            pat: rdmsr(msr::IA32_PAT),
            debugctl: rdmsr(msr::IA32_DEBUGCTL),
            perf_global_ctrl,
            sysenter_cs: rdmsr(msr::IA32_SYSENTER_CS),
            sysenter_esp: rdmsr(msr::IA32_SYSENTER_ESP),
            sysenter_eip: rdmsr(msr::IA32_SYSENTER_EIP),
            fs_base: rdmsr(msr::IA32_FS_BASE),
            gs_base: rdmsr(msr::IA32_GS_BASE),
            rflags: x86::bits64::rflags::read().bits(),
            dr7: read_dr7(),
            selectors: read_selectors(),
            gdtr: TablePointer {
                base: gdtr.base as u64,
                limit: gdtr.limit,
            },
            idtr: TablePointer {
                base: idtr.base as u64,
                limit: idtr.limit,
            },
        }
    }
}

fn read_dr7() -> u64 {
    let dr7: u64;
    unsafe { asm!("mov {}, dr7", out(reg) dr7, options(nomem, nostack, preserves_flags)) };
    dr7
}

fn read_selectors() -> Selectors {
    let (es, cs, ss, ds, fs, gs): (u16, u16, u16, u16, u16, u16);
    let (ldtr, tr): (u16, u16);
    unsafe {
        asm!("mov {0:x}, es", out(reg) es, options(nomem, nostack, preserves_flags));
        asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
        asm!("mov {0:x}, ss", out(reg) ss, options(nomem, nostack, preserves_flags));
        asm!("mov {0:x}, ds", out(reg) ds, options(nomem, nostack, preserves_flags));
        asm!("mov {0:x}, fs", out(reg) fs, options(nomem, nostack, preserves_flags));
        asm!("mov {0:x}, gs", out(reg) gs, options(nomem, nostack, preserves_flags));
        asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack, preserves_flags));
        asm!("str {0:x}", out(reg) tr, options(nomem, nostack, preserves_flags));
    }
    Selectors {
        es,
        cs,
        ss,
        ds,
        fs,
        gs,
        ldtr,
        tr,
    }
}

/// Enable VMX operation on this CPU: take the feature-control lock if
/// firmware left it open, verify VMX is permitted outside SMX, and bring
/// CR0/CR4 within the `IA32_VMX_*_FIXED` envelopes.
pub fn enable_vmx_operation() -> Result<()> {
    unsafe {
        let mut control = rdmsr(msr::IA32_FEATURE_CONTROL);
        if control & FEATURE_CONTROL_LOCK == 0 {
            control |= FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMX_OUTSIDE_SMX;
            wrmsr(msr::IA32_FEATURE_CONTROL, control);
        } else if control & FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0 {
            log::error!("firmware locked VMX off outside SMX");
            return Err(Error::HardwareUnavailable("VMX locked off by firmware"));
        }

        let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
        let mut cr0 = controlregs::cr0();
        cr0 |= controlregs::Cr0::from_bits_truncate(fixed0 as usize);
        cr0 &= controlregs::Cr0::from_bits_truncate(fixed1 as usize);
        controlregs::cr0_write(cr0);

        let fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);
        let mut cr4 = controlregs::cr4();
        cr4 |= Cr4::CR4_ENABLE_VMX;
        cr4 |= Cr4::from_bits_truncate(fixed0 as usize);
        cr4 &= Cr4::from_bits_truncate(fixed1 as usize);
        controlregs::cr4_write(cr4);
    }
    Ok(())
}

fn vmx_result(insn: &'static str, result: core::result::Result<(), VmFail>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(VmFail::VmFailValid) => Err(Error::VmxInstruction {
            insn,
            code: instruction_error(),
        }),
        Err(VmFail::VmFailInvalid) => Err(Error::VmxInstruction { insn, code: 0 }),
    }
}

/// The current VMCS's VM-instruction error field.
pub fn instruction_error() -> u64 {
    unsafe { vmx::vmread(x86::vmx::vmcs::ro::VM_INSTRUCTION_ERROR).unwrap_or(0) }
}

/// Enter VMX root operation against the VMXON region at `phys`.
pub fn vmxon(phys: u64) -> Result<()> {
    vmx_result("vmxon", unsafe { vmx::vmxon(phys) })
}

/// Leave VMX root operation.
pub fn vmxoff() -> Result<()> {
    vmx_result("vmxoff", unsafe { vmx::vmxoff() })
}

/// Clear the VMCS at `phys`.
pub fn vmclear(phys: u64) -> Result<()> {
    vmx_result("vmclear", unsafe { vmx::vmclear(phys) })
}

/// Make the VMCS at `phys` current.
pub fn vmptrld(phys: u64) -> Result<()> {
    vmx_result("vmptrld", unsafe { vmx::vmptrld(phys) })
}

/// Write a VMCS field.
pub fn vmwrite(field: u32, value: u64) -> Result<()> {
    vmx_result("vmwrite", unsafe { vmx::vmwrite(field, value) })
}

/// Launch the current VMCS, resuming this CPU as guest-0.
///
/// Guest RSP/RIP are written inside the instruction sequence itself so
/// that a successful VMLAUNCH lands the guest on the very next
/// instruction with the stack intact: the OS continues as if the call
/// simply returned. General-purpose registers are not loaded by VM entry
/// and carry across unchanged.
pub fn vmlaunch_as_guest(guest_rsp_field: u32, guest_rip_field: u32) -> Result<()> {
    let failed: u64;
    unsafe {
        asm!(
            "vmwrite {rsp_field}, rsp",
            "lea {tmp}, [rip + 2f]",
            "vmwrite {rip_field}, {tmp}",
            "vmlaunch",
            // Reached only when VMLAUNCH faults back.
            "mov {failed}, 1",
            "jmp 3f",
            "2:",
            // Guest-0 resumes here.
            "mov {failed}, 0",
            "3:",
            rsp_field = in(reg) u64::from(guest_rsp_field),
            rip_field = in(reg) u64::from(guest_rip_field),
            tmp = out(reg) _,
            failed = out(reg) failed,
        );
    }

    if failed != 0 {
        return Err(Error::VmxInstruction {
            insn: "vmlaunch",
            code: instruction_error(),
        });
    }
    Ok(())
}
