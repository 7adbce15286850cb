//! Bytecode representation: the instruction set, function stubs, and the
//! binary wire format.

pub mod decode;
pub mod encode;
pub mod opcode;
pub mod stub;

pub use decode::{decode_program, decode_stub, MAGIC, VERSION};
pub use encode::{encode_program, encode_stub};
pub use opcode::{AssignOp, Instruction, Opcode, OperatorCode};
pub use stub::{Capture, Stub, DYNAMIC_BIND_TOKEN, NATIVE_FILE_ID};
