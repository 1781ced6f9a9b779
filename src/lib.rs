//! # mkvisor
//!
//! The loader and bring-up core of a microkernel-style VMM.
//!
//! An unprivileged process submits a bundle — a microkernel ELF image
//! plus one or more extension ELF images — through a single control
//! entry point. The loader validates the request, stages everything the
//! microkernel needs at runtime (page pools, huge pool, debug ring, a
//! freshly built 4-level root page table), maps the microkernel and its
//! extensions into that address space, and then transitions every
//! logical processor into VMX-root operation with the running OS
//! resumed transparently as guest-0.
//!
//! The crate is freestanding of any particular kernel: everything it
//! needs from the embedding environment (page allocation, copy-from-user,
//! physical translation, per-CPU fan-out) comes through the
//! [`Platform`] trait, which the kernel shim implements.
//!
//! ## Lifecycle
//!
//! - `start`: validate → stage resources → build the address space →
//!   per-CPU VMX bring-up. Any failure rolls the acquired prefix back in
//!   reverse order.
//! - `stop`: reverse per-CPU teardown, then release every resource.
//! - A teardown failure is terminal: the VMM reports itself corrupt and
//!   refuses further starts until the process restarts.

pub mod args;
pub mod backend;
pub mod control;
pub mod elf;
mod error;
pub mod layout;
pub mod mapper;
#[cfg(test)]
pub(crate) mod mock;
pub mod paging;
mod platform;
pub mod pools;
pub mod ring;
pub mod span;
mod vmm;

// Re-exports
pub use args::StartArgs;
pub use backend::{LaunchContext, VcpuBackend};
pub use error::{Error, Result};
pub use platform::{alloc_contiguous_pages, alloc_pages, for_each_cpu, CpuOrder, Platform};
pub use span::{MutableSpan, Span};
pub use vmm::{Vmm, VmmStatus};

/// Check whether the current machine can host the VMM at all.
///
/// Returns `true` if the CPU advertises the required virtualization
/// support.
pub fn is_supported() -> bool {
    backend::is_available()
}
