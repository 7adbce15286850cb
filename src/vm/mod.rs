//! The execution engine: frames, dispatch, calls, operators, catchables,
//! and module imports.

mod frame;
mod imports;
mod vm;
mod vm_calls;
mod vm_catchable;
mod vm_operators;

pub use vm::{ExternalHandler, Importer, UnhandledCallback, Vm, MAX_CALL_DEPTH};
pub use vm_catchable::CatchableKind;
