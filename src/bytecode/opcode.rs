//! The instruction set.
//!
//! On the wire every instruction is 11 bytes, little-endian: a `u16` line
//! offset from the stub's starting line, a `u8` opcode tag, and 8 data
//! bytes whose layout is noted per variant below. Unused data bytes are
//! written as zero and ignored on decode.

/// Assignment flavor for referrable and member writes. The compound forms
/// read-modify-write through the matching binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    None,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl AssignOp {
    pub fn from_byte(byte: u8) -> Option<AssignOp> {
        Some(match byte {
            0 => AssignOp::None,
            1 => AssignOp::Add,
            2 => AssignOp::Sub,
            3 => AssignOp::Mul,
            4 => AssignOp::Div,
            5 => AssignOp::Mod,
            6 => AssignOp::Pow,
            7 => AssignOp::BitAnd,
            8 => AssignOp::BitOr,
            9 => AssignOp::BitXor,
            10 => AssignOp::Shl,
            11 => AssignOp::Shr,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            AssignOp::None => 0,
            AssignOp::Add => 1,
            AssignOp::Sub => 2,
            AssignOp::Mul => 3,
            AssignOp::Div => 4,
            AssignOp::Mod => 5,
            AssignOp::Pow => 6,
            AssignOp::BitAnd => 7,
            AssignOp::BitOr => 8,
            AssignOp::BitXor => 9,
            AssignOp::Shl => 10,
            AssignOp::Shr => 11,
        }
    }

    /// The binary operator a compound assignment applies, if any.
    pub fn operator(self) -> Option<OperatorCode> {
        Some(match self {
            AssignOp::None => return None,
            AssignOp::Add => OperatorCode::Add,
            AssignOp::Sub => OperatorCode::Sub,
            AssignOp::Mul => OperatorCode::Mul,
            AssignOp::Div => OperatorCode::Div,
            AssignOp::Mod => OperatorCode::Mod,
            AssignOp::Pow => OperatorCode::Pow,
            AssignOp::BitAnd => OperatorCode::BitAnd,
            AssignOp::BitOr => OperatorCode::BitOr,
            AssignOp::BitXor => OperatorCode::BitXor,
            AssignOp::Shl => OperatorCode::Shl,
            AssignOp::Shr => OperatorCode::Shr,
        })
    }
}

/// Operator family dispatched by the `Operator` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCode {
    // --- Arithmetic ---
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,

    // --- Comparison ---
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,

    // --- Bitwise ---
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,

    // --- Overload-only ---
    Arrow,
    Question,
    Diamond,

    // --- Unary ---
    Not,
    BitNot,
    Negate,
    Count,
}

impl OperatorCode {
    pub fn from_byte(byte: u8) -> Option<OperatorCode> {
        Some(match byte {
            0 => OperatorCode::Add,
            1 => OperatorCode::Sub,
            2 => OperatorCode::Mul,
            3 => OperatorCode::Div,
            4 => OperatorCode::Mod,
            5 => OperatorCode::Pow,
            6 => OperatorCode::Eq,
            7 => OperatorCode::NotEq,
            8 => OperatorCode::Less,
            9 => OperatorCode::LessEq,
            10 => OperatorCode::Greater,
            11 => OperatorCode::GreaterEq,
            12 => OperatorCode::BitAnd,
            13 => OperatorCode::BitOr,
            14 => OperatorCode::BitXor,
            15 => OperatorCode::Shl,
            16 => OperatorCode::Shr,
            17 => OperatorCode::Arrow,
            18 => OperatorCode::Question,
            19 => OperatorCode::Diamond,
            20 => OperatorCode::Not,
            21 => OperatorCode::BitNot,
            22 => OperatorCode::Negate,
            23 => OperatorCode::Count,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            OperatorCode::Add => 0,
            OperatorCode::Sub => 1,
            OperatorCode::Mul => 2,
            OperatorCode::Div => 3,
            OperatorCode::Mod => 4,
            OperatorCode::Pow => 5,
            OperatorCode::Eq => 6,
            OperatorCode::NotEq => 7,
            OperatorCode::Less => 8,
            OperatorCode::LessEq => 9,
            OperatorCode::Greater => 10,
            OperatorCode::GreaterEq => 11,
            OperatorCode::BitAnd => 12,
            OperatorCode::BitOr => 13,
            OperatorCode::BitXor => 14,
            OperatorCode::Shl => 15,
            OperatorCode::Shr => 16,
            OperatorCode::Arrow => 17,
            OperatorCode::Question => 18,
            OperatorCode::Diamond => 19,
            OperatorCode::Not => 20,
            OperatorCode::BitNot => 21,
            OperatorCode::Negate => 22,
            OperatorCode::Count => 23,
        }
    }

    /// The symbol scripts use in attribute tables, also shown in
    /// diagnostics.
    pub fn symbol(self) -> &'static str {
        match self {
            OperatorCode::Add => "+",
            OperatorCode::Sub => "-",
            OperatorCode::Mul => "*",
            OperatorCode::Div => "/",
            OperatorCode::Mod => "%",
            OperatorCode::Pow => "**",
            OperatorCode::Eq => "==",
            OperatorCode::NotEq => "!=",
            OperatorCode::Less => "<",
            OperatorCode::LessEq => "<=",
            OperatorCode::Greater => ">",
            OperatorCode::GreaterEq => ">=",
            OperatorCode::BitAnd => "&",
            OperatorCode::BitOr => "|",
            OperatorCode::BitXor => "^",
            OperatorCode::Shl => "<<",
            OperatorCode::Shr => ">>",
            OperatorCode::Arrow => "->",
            OperatorCode::Question => "?",
            OperatorCode::Diamond => "<>",
            OperatorCode::Not => "!",
            OperatorCode::BitNot => "~",
            OperatorCode::Negate => "-",
            OperatorCode::Count => "#",
        }
    }

    pub fn is_unary(self) -> bool {
        matches!(
            self,
            OperatorCode::Not | OperatorCode::BitNot | OperatorCode::Negate | OperatorCode::Count
        )
    }
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Opcode {
    /// Do nothing.
    Noop,

    // --- Literals ---
    /// Push the empty value.
    PushEmpty,
    /// Push a number. Data: `f64`.
    PushNumber(f64),
    /// Push a boolean. Data: `u8` (nonzero is true).
    PushBoolean(bool),
    /// Push an entry of the stub's interned string pool. Data: `index: u32`.
    PushString(u32),
    /// Push a fresh empty object.
    NewObject,
    /// Push an unactivated function for a stub in the current file.
    /// Data: `stub_id: u32`; the file id is filled in at decode time so
    /// cross-file literals resolve lazily by identity.
    NewFunction { file_id: u32, stub_id: u32 },
    /// Like `NewFunction`, but first pops one Type per declared parameter
    /// plus a return Type (return type on top) to form a strict signature.
    /// Data: `stub_id: u32`.
    NewFunctionTyped { file_id: u32, stub_id: u32 },
    /// Push one of the built-in Type values. Data: `code: u8`.
    PushBuiltinType(u8),

    // --- Referrables ---
    /// Push a copy of a referrable. Data: `index: u32`.
    ReferrableLoad(u32),
    /// Pop a value and write it to a referrable, through the compound
    /// operator if one is given. Data: `index: u32`, `op: u8`.
    ReferrableAssign { index: u32, op: AssignOp },

    // --- Members ---
    /// Pop a key, then an object; push the member value. The dot form
    /// requires a String key; the bracket form takes any key.
    /// Data: `bracket: u8`.
    MemberLoad { bracket: bool },
    /// Pop a value, a key, then an object; write the member, through the
    /// compound operator if one is given. Pushes nothing.
    /// Data: `op: u8`, `bracket: u8`.
    MemberAssign { op: AssignOp, bracket: bool },

    // --- Calls ---
    /// Pop `argc` name/value pairs (value pushed after its name), then the
    /// callee; push the call result. Data: `argc: u32`.
    Call(u32),
    /// Pop an argument object, then the callee; spread the object's keys
    /// as named arguments and push the call result.
    CallVarArg,
    /// Push the private binding carried by the current frame.
    PushPrivateBinding,
    /// Push the value of a registered external function.
    /// Data: `index: u32`.
    ExternalLoad(u32),

    // --- Control ---
    /// Skip the next `n` instructions. Data: `n: u32`.
    Skip(u32),
    /// Pop a value; skip the next `n` instructions when it coerces false.
    /// Data: `n: u32`.
    SkipIfFalse(u32),
    /// Peek at the top value without popping; skip when it coerces false
    /// (short-circuit `&&`). Data: `n: u32`.
    AndSkip(u32),
    /// Peek at the top value without popping; skip when it coerces true
    /// (short-circuit `||`). Data: `n: u32`.
    OrSkip(u32),
    /// Apply an operator to the top one or two values. Data: `code: u8`.
    Operator(OperatorCode),
    /// Pop a response object, then a gated function; run the function and
    /// intercept a raised catchable through the response's `onError` /
    /// `onSend` member.
    Listen,
    /// Terminate this frame's instruction stream immediately.
    Return,

    // --- Stack hygiene ---
    /// Pop `n` values. Data: `n: u32`.
    Pop(u32),
    /// Duplicate the top value.
    Copy,
}

impl Opcode {
    /// The wire tag byte.
    pub fn wire_code(&self) -> u8 {
        match self {
            Opcode::Noop => 0,
            Opcode::PushEmpty => 1,
            Opcode::PushNumber(_) => 2,
            Opcode::PushBoolean(_) => 3,
            Opcode::PushString(_) => 4,
            Opcode::NewObject => 5,
            Opcode::NewFunction { .. } => 6,
            Opcode::NewFunctionTyped { .. } => 7,
            Opcode::PushBuiltinType(_) => 8,
            Opcode::ReferrableLoad(_) => 9,
            Opcode::ReferrableAssign { .. } => 10,
            Opcode::MemberLoad { .. } => 11,
            Opcode::MemberAssign { .. } => 12,
            Opcode::Call(_) => 13,
            Opcode::CallVarArg => 14,
            Opcode::PushPrivateBinding => 15,
            Opcode::ExternalLoad(_) => 16,
            Opcode::Skip(_) => 17,
            Opcode::SkipIfFalse(_) => 18,
            Opcode::AndSkip(_) => 19,
            Opcode::OrSkip(_) => 20,
            Opcode::Operator(_) => 21,
            Opcode::Listen => 22,
            Opcode::Return => 23,
            Opcode::Pop(_) => 24,
            Opcode::Copy => 25,
        }
    }
}

/// An instruction with its resolved source line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub line: u32,
    pub op: Opcode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_op_bytes_round_trip() {
        for byte in 0..=11u8 {
            let op = AssignOp::from_byte(byte).unwrap();
            assert_eq!(op.to_byte(), byte);
        }
        assert_eq!(AssignOp::from_byte(12), None);
    }

    #[test]
    fn test_operator_bytes_round_trip() {
        for byte in 0..=23u8 {
            let op = OperatorCode::from_byte(byte).unwrap();
            assert_eq!(op.to_byte(), byte);
        }
        assert_eq!(OperatorCode::from_byte(24), None);
    }

    #[test]
    fn test_compound_assign_maps_to_operator() {
        assert_eq!(AssignOp::Add.operator(), Some(OperatorCode::Add));
        assert_eq!(AssignOp::Shr.operator(), Some(OperatorCode::Shr));
        assert_eq!(AssignOp::None.operator(), None);
    }

    #[test]
    fn test_unary_classification() {
        assert!(OperatorCode::Not.is_unary());
        assert!(OperatorCode::Count.is_unary());
        assert!(!OperatorCode::Add.is_unary());
        assert!(!OperatorCode::Diamond.is_unary());
    }
}
