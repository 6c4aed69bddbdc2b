//! Range-extension thunk creation for architectures whose branch immediates can't span a
//! large output section (AArch64 ± 128 MiB, ARM32 ± 16 MiB, PPC64 ± 32 MiB).
//!
//! Given an output section whose members have already been selected and ordered, the pass
//! assigns every member its byte offset, interleaves thunks between them, and records for
//! each call relocation which thunk entry it should branch to. Parsing input files, resolving
//! symbols, and writing the thunk instructions are the surrounding linker's jobs; the data
//! model in [`symbol_db`] and [`section`] is the contract with it.

pub mod alignment;
pub mod arch;
pub mod elf;
pub mod error;
pub mod layout;
pub mod section;
pub mod symbol_db;
pub mod thunk;

pub use crate::arch::AArch64;
pub use crate::arch::Arch;
pub use crate::arch::Arm;
pub use crate::arch::Ppc64;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::layout::create_range_extension_thunks;
