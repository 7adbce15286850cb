//! Error types for bytecode loading and engine faults.

use thiserror::Error;

/// Bytecode decoding errors.
///
/// A stub that fails to decode is rejected outright; the loader never
/// substitutes a degenerate stub for malformed input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Bad magic tag at offset {0}")]
    BadMagic(usize),

    #[error("Unsupported bytecode version {0}")]
    UnsupportedVersion(u8),

    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEof(usize),

    #[error("Invalid UTF-32 codepoint {codepoint:#x} at offset {offset}")]
    InvalidCodepoint { codepoint: u32, offset: usize },

    #[error("Unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("Invalid {what} payload at offset {offset}: {reason}")]
    InvalidPayload {
        what: &'static str,
        offset: usize,
        reason: &'static str,
    },
}

impl LoadError {
    pub fn bad_magic(offset: usize) -> Self {
        Self::BadMagic(offset)
    }

    pub fn unexpected_eof(offset: usize) -> Self {
        Self::UnexpectedEof(offset)
    }

    pub fn invalid_codepoint(codepoint: u32, offset: usize) -> Self {
        Self::InvalidCodepoint { codepoint, offset }
    }

    pub fn unknown_opcode(opcode: u8, offset: usize) -> Self {
        Self::UnknownOpcode { opcode, offset }
    }

    pub fn invalid_payload(what: &'static str, offset: usize, reason: &'static str) -> Self {
        Self::InvalidPayload {
            what,
            offset,
            reason,
        }
    }
}

/// Engine faults raised during execution.
///
/// These never surface as Rust errors to the embedder; the engine converts
/// each one into an in-language error catchable carrying the rendered
/// message, so scripts can intercept them with `listen`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeFault {
    #[error("Operand stack underflow")]
    StackUnderflow,

    #[error("Invalid referrable index {0}")]
    InvalidReferrable(u32),

    #[error("Capture refers to a frame that is no longer on the call stack")]
    InvalidCapture,

    #[error("Value of type {0} is not callable")]
    NotCallable(&'static str),

    #[error("Call depth limit of {0} exceeded")]
    StackLimit(usize),

    #[error("No function stub {stub_id} in file {file_id}")]
    UnknownStub { file_id: u32, stub_id: u32 },

    #[error("No external function registered at index {0}")]
    UnknownExternal(u32),

    #[error("String pool index {0} out of range")]
    InvalidStringIndex(u32),

    #[error("Invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Could not import module '{name}': {reason}")]
    Import { name: String, reason: String },
}

impl RuntimeFault {
    pub fn not_callable(tag: &'static str) -> Self {
        Self::NotCallable(tag)
    }

    pub fn unknown_stub(file_id: u32, stub_id: u32) -> Self {
        Self::UnknownStub { file_id, stub_id }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn import(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Import {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
