//! Error types for mkvisor.

use thiserror::Error;

/// Result type alias using mkvisor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or stopping the VMM.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied value failed validation (null pointer, unsupported
    /// ABI version, oversize ELF, inconsistent span).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform allocator returned null.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// Copying the request payload out of user memory faulted.
    #[error("copy from user memory faulted")]
    UserCopyFault,

    /// A virtual address was already mapped at the page-table leaf.
    #[error("virtual address 0x{virt:016x} is already mapped")]
    MappingConflict {
        /// The conflicting virtual address.
        virt: u64,
    },

    /// The CPU cannot run the VMM (missing CPUID feature, or VMX locked
    /// off by firmware).
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(&'static str),

    /// A VMX instruction failed. `code` is the VM-instruction error field
    /// when the failure was VMfailValid, 0 otherwise.
    #[error("{insn} failed with VM-instruction error {code}")]
    VmxInstruction {
        /// The instruction that failed.
        insn: &'static str,
        /// The VM-instruction error field.
        code: u64,
    },

    /// Teardown failed partway through; the VMM is neither running cleanly
    /// nor safely stopped. This state is terminal until process restart.
    #[error("partial teardown left the VMM corrupt")]
    TeardownCorruption,
}
