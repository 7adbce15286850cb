//! Mattevm: an embeddable dynamic-language runtime.
//!
//! This is the library root that exports all modules.
//!
//! # Pieces
//!
//! The runtime splits into three layers:
//! - **Value store**: tagged values, objects, strings, and a hybrid
//!   reference-count + mark/sweep garbage collector
//! - **Bytecode**: the binary stub format, its decoder and encoder
//! - **Engine**: the dispatch loop, call protocol, loop trampoline,
//!   catchable propagation, externals, and module imports

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::module_inception)]
#![allow(clippy::ptr_arg)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_large_err)]

pub mod bytecode;
pub mod error;
pub mod store;
pub mod vm;

pub use bytecode::{decode_program, decode_stub, encode_program, encode_stub, Stub};
pub use error::{LoadError, RuntimeFault};
pub use store::{Value, ValueStore};
pub use vm::{CatchableKind, Vm};
