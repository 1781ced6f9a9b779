//! x86-64 4-level paging structures.
//!
//! [`pte::Pte`] is the bit-exact 64-bit entry shared with the
//! microkernel; [`rpt::RootPageTable`] builds the PML4-rooted tree the
//! microkernel runs under.

pub mod pte;
pub mod rpt;

pub use pte::Pte;
pub use rpt::{PageAttr, RootPageTable};
