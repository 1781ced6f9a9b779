//! VMCS state computation.
//!
//! Everything here is pure: control-field math over the `IA32_VMX_TRUE_*`
//! capability MSRs, host control-register seeding from CPUID feature
//! bits, and guest access-rights conversion. The raw reads and writes
//! live in [`super::support`]; keeping the math separate is what lets it
//! run under test on any host.

use crate::error::{Error, Result};

/// Control and feature register bits the bring-up composes.
#[allow(dead_code)]
pub mod bits {
    // CR0
    pub const CR0_PE: u64 = 1 << 0;
    pub const CR0_MP: u64 = 1 << 1;
    pub const CR0_NE: u64 = 1 << 5;
    pub const CR0_WP: u64 = 1 << 16;
    pub const CR0_PG: u64 = 1 << 31;

    // CR4
    pub const CR4_PAE: u64 = 1 << 5;
    pub const CR4_PGE: u64 = 1 << 7;
    pub const CR4_OSFXSR: u64 = 1 << 9;
    pub const CR4_OSXMMEXCPT: u64 = 1 << 10;
    pub const CR4_VMXE: u64 = 1 << 13;
    pub const CR4_OSXSAVE: u64 = 1 << 18;
    pub const CR4_SMEP: u64 = 1 << 20;
    pub const CR4_SMAP: u64 = 1 << 21;

    // IA32_EFER
    pub const EFER_LME: u64 = 1 << 8;
    pub const EFER_LMA: u64 = 1 << 10;
    pub const EFER_NXE: u64 = 1 << 11;

    // Primary processor-based execution controls
    pub const PROC_USE_IO_BITMAPS: u32 = 1 << 25;
    pub const PROC_USE_MSR_BITMAP: u32 = 1 << 28;
    pub const PROC_SECONDARY_CONTROLS: u32 = 1 << 31;

    // Secondary processor-based execution controls
    pub const PROC2_ENABLE_RDTSCP: u32 = 1 << 3;
    pub const PROC2_ENABLE_VPID: u32 = 1 << 5;
    pub const PROC2_ENABLE_INVPCID: u32 = 1 << 12;
    pub const PROC2_ENABLE_XSAVES: u32 = 1 << 20;

    // VM-exit controls
    pub const EXIT_SAVE_DEBUG_CONTROLS: u32 = 1 << 2;
    pub const EXIT_HOST_ADDRESS_SPACE_SIZE: u32 = 1 << 9;
    pub const EXIT_LOAD_PERF_GLOBAL_CTRL: u32 = 1 << 12;
    pub const EXIT_SAVE_PAT: u32 = 1 << 18;
    pub const EXIT_LOAD_PAT: u32 = 1 << 19;
    pub const EXIT_SAVE_EFER: u32 = 1 << 20;
    pub const EXIT_LOAD_EFER: u32 = 1 << 21;

    // VM-entry controls
    pub const ENTRY_LOAD_DEBUG_CONTROLS: u32 = 1 << 2;
    pub const ENTRY_IA32E_MODE_GUEST: u32 = 1 << 9;
    pub const ENTRY_LOAD_PERF_GLOBAL_CTRL: u32 = 1 << 13;
    pub const ENTRY_LOAD_PAT: u32 = 1 << 14;
    pub const ENTRY_LOAD_EFER: u32 = 1 << 15;

    /// VMCS access-rights "segment unusable" flag.
    pub const AR_UNUSABLE: u32 = 1 << 16;
    /// Busy 64-bit TSS type.
    pub const AR_TSS_BUSY: u32 = 0xB;
    /// Access-rights present bit.
    pub const AR_PRESENT: u32 = 0x80;
}

/// A VMCS control field seeded from its `IA32_VMX_TRUE_*` capability MSR.
///
/// The MSR's low 32 bits are must-be-one, the high 32 allowed-one; the
/// field starts at their intersection and individual features are OR'd
/// in, either required or opportunistic.
#[derive(Debug, Clone, Copy)]
pub struct ControlField {
    value: u32,
    allowed1: u32,
}

impl ControlField {
    /// Seed from a capability MSR value.
    pub fn from_capability_msr(raw: u64) -> Self {
        let allowed0 = raw as u32;
        let allowed1 = (raw >> 32) as u32;
        Self {
            value: allowed0 & allowed1,
            allowed1,
        }
    }

    /// Enable `feature`, failing if the CPU does not allow it.
    pub fn enable(&mut self, feature: u32, what: &'static str) -> Result<()> {
        if self.allowed1 & feature != feature {
            log::error!("CPU does not allow required VMX control: {what}");
            return Err(Error::HardwareUnavailable(what));
        }
        self.value |= feature;
        Ok(())
    }

    /// Enable `feature` when the CPU allows it; reports whether it did.
    pub fn enable_if_allowed(&mut self, feature: u32) -> bool {
        if self.allowed1 & feature == feature {
            self.value |= feature;
            true
        } else {
            false
        }
    }

    /// The composed field value.
    pub fn value(self) -> u32 {
        self.value
    }
}

/// CPUID-derived feature bits the bring-up consults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    /// VMX operation supported.
    pub vmx: bool,
    /// 64-bit (long) mode supported.
    pub lme: bool,
    /// Execute-disable supported.
    pub nx: bool,
    /// XSAVE supported and enabled by the OS.
    pub xsave: bool,
    /// Supervisor-mode execution prevention.
    pub smep: bool,
    /// Supervisor-mode access prevention.
    pub smap: bool,
    /// INVPCID supported.
    pub invpcid: bool,
    /// RDTSCP supported.
    pub rdtscp: bool,
    /// XSAVES/XRSTORS supported.
    pub xsaves: bool,
    /// Architectural perf-monitoring version.
    pub perf_version: u8,
}

impl CpuFeatures {
    /// Verify the baseline the VMM cannot run without.
    pub fn check_required(&self) -> Result<()> {
        if !self.vmx {
            return Err(Error::HardwareUnavailable("CPU does not support VMX"));
        }
        if !self.lme {
            return Err(Error::HardwareUnavailable("CPU does not support long mode"));
        }
        if !self.nx {
            return Err(Error::HardwareUnavailable("CPU does not support NX"));
        }
        Ok(())
    }

    /// The host CR0: architecturally required bits only.
    pub fn host_cr0(&self) -> u64 {
        bits::CR0_PE | bits::CR0_MP | bits::CR0_NE | bits::CR0_WP | bits::CR0_PG
    }

    /// The host CR4: required bits plus the conditionally available ones.
    pub fn host_cr4(&self) -> u64 {
        let mut cr4 = bits::CR4_PAE
            | bits::CR4_PGE
            | bits::CR4_OSFXSR
            | bits::CR4_OSXMMEXCPT
            | bits::CR4_VMXE;
        if self.xsave {
            cr4 |= bits::CR4_OSXSAVE;
        }
        if self.smep {
            cr4 |= bits::CR4_SMEP;
        }
        if self.smap {
            cr4 |= bits::CR4_SMAP;
        }
        cr4
    }

    /// The host EFER: long mode active with NX.
    pub fn host_efer(&self) -> u64 {
        bits::EFER_LME | bits::EFER_LMA | bits::EFER_NXE
    }
}

/// Captured register state of the CPU the bring-up is running on.
///
/// Everything the guest state needs to make VM entry resume the OS
/// transparently, read before any VMX instruction touches the CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSnapshot {
    /// CR0 as the OS runs with it.
    pub cr0: u64,
    /// CR3 of the running OS.
    pub cr3: u64,
    /// CR4 as the OS runs with it.
    pub cr4: u64,
    /// IA32_EFER.
    pub efer: u64,
    /// IA32_PAT.
    pub pat: u64,
    /// IA32_DEBUGCTL.
    pub debugctl: u64,
    /// IA32_PERF_GLOBAL_CTRL, when architectural perf-monitoring ≥ 2.
    pub perf_global_ctrl: Option<u64>,
    /// IA32_SYSENTER_CS.
    pub sysenter_cs: u64,
    /// IA32_SYSENTER_ESP.
    pub sysenter_esp: u64,
    /// IA32_SYSENTER_EIP.
    pub sysenter_eip: u64,
    /// IA32_FS_BASE.
    pub fs_base: u64,
    /// IA32_GS_BASE.
    pub gs_base: u64,
    /// RFLAGS.
    pub rflags: u64,
    /// DR7.
    pub dr7: u64,
    /// Segment selectors: es, cs, ss, ds, fs, gs, ldtr, tr.
    pub selectors: Selectors,
    /// GDTR base and limit.
    pub gdtr: TablePointer,
    /// IDTR base and limit.
    pub idtr: TablePointer,
}

/// The running OS's segment selectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selectors {
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr: u16,
    pub tr: u16,
}

/// A descriptor table location.
#[derive(Debug, Clone, Copy, Default)]
pub struct TablePointer {
    /// Table base address.
    pub base: u64,
    /// Table size in bytes, minus one.
    pub limit: u16,
}

/// Convert a captured attribute word into a VMCS access-rights value.
///
/// A null selector yields the "unusable" marker rather than attributes.
pub fn segment_access_rights(selector: u16, attrib: u16) -> u32 {
    if selector >> 3 == 0 {
        bits::AR_UNUSABLE
    } else {
        u32::from(attrib)
    }
}

/// Access rights for the guest TR, which must never be unusable: a null
/// task register reads as a busy 64-bit TSS.
pub fn tr_access_rights(selector: u16, attrib: u16) -> u32 {
    if selector >> 3 == 0 {
        bits::AR_TSS_BUSY | bits::AR_PRESENT
    } else {
        u32::from(attrib)
    }
}

/// Strip the reserved top bit off an `IA32_VMX_BASIC` value to get the
/// VMCS revision identifier.
pub fn revision_id(vmx_basic: u64) -> u32 {
    (vmx_basic as u32) & !(1 << 31)
}
