//! Function stubs: the immutable templates functions are built from.

use super::opcode::Instruction;

/// Reserved file id for native external functions. Stubs in file 0 have no
/// instruction body; the engine dispatches them to registered host code.
pub const NATIVE_FILE_ID: u32 = 0;

/// Parameter name that triggers dynamic binding: the slot is filled with
/// the function's originating object instead of a caller argument.
pub const DYNAMIC_BIND_TOKEN: &str = "$";

/// One entry of a stub's capture table. Resolved against the live call
/// stack at read time: the innermost frame whose stub has `stub_id` (in
/// the capturing stub's file) supplies the referrable at `referrable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub stub_id: u32,
    pub referrable: u32,
}

/// A decoded function template. Immutable once loaded; identified by the
/// `(file_id, stub_id)` pair for the engine's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Stub {
    pub file_id: u32,
    pub stub_id: u32,
    pub is_vararg: bool,
    /// Declared parameter names, in declaration order.
    pub arguments: Vec<Box<str>>,
    /// Declared local names, in declaration order.
    pub locals: Vec<Box<str>>,
    /// Interned string pool for `PushString`.
    pub strings: Vec<Box<str>>,
    pub captures: Vec<Capture>,
    pub instructions: Vec<Instruction>,
    pub starting_line: u32,
}

impl Stub {
    /// Referrable slots owned by a frame running this stub: the context,
    /// one per argument, one per local. Captures are addressed past this
    /// range.
    pub fn referrable_count(&self) -> usize {
        1 + self.arguments.len() + self.locals.len()
    }

    /// Whether any parameter is the dynamic-bind token.
    pub fn is_dynamic_bind(&self) -> bool {
        self.arguments.iter().any(|a| a.as_ref() == DYNAMIC_BIND_TOKEN)
    }

    /// Slot index of a declared argument.
    pub fn argument_slot(&self, name: &str) -> Option<usize> {
        self.arguments
            .iter()
            .position(|a| a.as_ref() == name)
            .map(|i| i + 1)
    }

    /// A bodyless stub for a native external function. Argument names are
    /// kept so host calls bind the same way bytecode calls do.
    pub fn native(stub_id: u32, arguments: &[&str]) -> Stub {
        Stub {
            file_id: NATIVE_FILE_ID,
            stub_id,
            is_vararg: false,
            arguments: arguments.iter().map(|a| (*a).into()).collect(),
            locals: Vec::new(),
            strings: Vec::new(),
            captures: Vec::new(),
            instructions: Vec::new(),
            starting_line: 0,
        }
    }

    pub fn is_native(&self) -> bool {
        self.file_id == NATIVE_FILE_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referrable_count() {
        let mut stub = Stub::native(0, &["a", "b"]);
        stub.locals.push("tmp".into());
        assert_eq!(stub.referrable_count(), 4);
    }

    #[test]
    fn test_dynamic_bind_detection() {
        let plain = Stub::native(0, &["a"]);
        assert!(!plain.is_dynamic_bind());
        let bound = Stub::native(0, &["$", "a"]);
        assert!(bound.is_dynamic_bind());
    }

    #[test]
    fn test_argument_slot_skips_context() {
        let stub = Stub::native(0, &["x", "y"]);
        assert_eq!(stub.argument_slot("x"), Some(1));
        assert_eq!(stub.argument_slot("y"), Some(2));
        assert_eq!(stub.argument_slot("z"), None);
    }
}
