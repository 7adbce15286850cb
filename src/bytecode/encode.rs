//! Binary stub encoding, the inverse of [`super::decode`].
//!
//! Used by tooling that synthesizes bytecode and by the round-trip tests;
//! the engine itself only decodes.

use super::decode::{MAGIC, VERSION};
use super::opcode::Opcode;
use super::stub::Stub;

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_utf32(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.chars().count() as u32);
    for c in s.chars() {
        push_u32(out, c as u32);
    }
}

/// Encode one stub. The stub's `file_id` is not written; files are an
/// engine-side notion assigned at load time.
pub fn encode_stub(stub: &Stub) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    push_u32(&mut out, stub.stub_id);
    out.push(u8::from(stub.is_vararg));

    out.push(stub.arguments.len() as u8);
    for name in &stub.arguments {
        push_utf32(&mut out, name);
    }
    out.push(stub.locals.len() as u8);
    for name in &stub.locals {
        push_utf32(&mut out, name);
    }
    push_u32(&mut out, stub.strings.len() as u32);
    for s in &stub.strings {
        push_utf32(&mut out, s);
    }

    out.extend_from_slice(&(stub.captures.len() as u16).to_le_bytes());
    for capture in &stub.captures {
        push_u32(&mut out, capture.stub_id);
        push_u32(&mut out, capture.referrable);
    }

    push_u32(&mut out, stub.instructions.len() as u32);
    push_u32(&mut out, stub.starting_line);
    for instruction in &stub.instructions {
        let offset = instruction.line.saturating_sub(stub.starting_line).min(u16::MAX as u32);
        out.extend_from_slice(&(offset as u16).to_le_bytes());
        out.push(instruction.op.wire_code());
        out.extend_from_slice(&instruction_data(&instruction.op));
    }
    out
}

/// Encode a whole program: stubs back to back.
pub fn encode_program(stubs: &[Stub]) -> Vec<u8> {
    let mut out = Vec::new();
    for stub in stubs {
        out.extend_from_slice(&encode_stub(stub));
    }
    out
}

fn u32_data(v: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&v.to_le_bytes());
    data
}

fn instruction_data(op: &Opcode) -> [u8; 8] {
    match op {
        Opcode::Noop
        | Opcode::PushEmpty
        | Opcode::NewObject
        | Opcode::CallVarArg
        | Opcode::PushPrivateBinding
        | Opcode::Listen
        | Opcode::Return
        | Opcode::Copy => [0u8; 8],
        Opcode::PushNumber(n) => n.to_le_bytes(),
        Opcode::PushBoolean(b) => {
            let mut data = [0u8; 8];
            data[0] = u8::from(*b);
            data
        }
        Opcode::PushString(idx) => u32_data(*idx),
        Opcode::NewFunction { stub_id, .. } | Opcode::NewFunctionTyped { stub_id, .. } => {
            u32_data(*stub_id)
        }
        Opcode::PushBuiltinType(code) => {
            let mut data = [0u8; 8];
            data[0] = *code;
            data
        }
        Opcode::ReferrableLoad(idx) => u32_data(*idx),
        Opcode::ReferrableAssign { index, op } => {
            let mut data = u32_data(*index);
            data[4] = op.to_byte();
            data
        }
        Opcode::MemberLoad { bracket } => {
            let mut data = [0u8; 8];
            data[0] = u8::from(*bracket);
            data
        }
        Opcode::MemberAssign { op, bracket } => {
            let mut data = [0u8; 8];
            data[0] = op.to_byte();
            data[1] = u8::from(*bracket);
            data
        }
        Opcode::Call(argc) => u32_data(*argc),
        Opcode::ExternalLoad(idx) => u32_data(*idx),
        Opcode::Skip(n) => u32_data(*n),
        Opcode::SkipIfFalse(n) => u32_data(*n),
        Opcode::AndSkip(n) => u32_data(*n),
        Opcode::OrSkip(n) => u32_data(*n),
        Opcode::Operator(code) => {
            let mut data = [0u8; 8];
            data[0] = code.to_byte();
            data
        }
        Opcode::Pop(n) => u32_data(*n),
    }
}

#[cfg(test)]
mod tests {
    use super::super::decode::{decode_program, decode_stub};
    use super::super::opcode::{AssignOp, Instruction, Opcode, OperatorCode};
    use super::super::stub::{Capture, Stub};
    use super::*;
    use pretty_assertions::assert_eq;

    fn instruction(line: u32, op: Opcode) -> Instruction {
        Instruction { line, op }
    }

    fn round_trip(stub: &Stub) -> Stub {
        let bytes = encode_stub(stub);
        let (decoded, used) = decode_stub(&bytes, stub.file_id).expect("decode failed");
        assert_eq!(used, bytes.len());
        decoded
    }

    fn stub_with_counts(args: usize, locals: usize, captures: usize) -> Stub {
        Stub {
            file_id: 1,
            stub_id: 42,
            is_vararg: false,
            arguments: (0..args).map(|i| format!("arg{i}").into()).collect(),
            locals: (0..locals).map(|i| format!("local{i}").into()).collect(),
            strings: vec!["one".into(), "two".into()],
            captures: (0..captures)
                .map(|i| Capture {
                    stub_id: i as u32,
                    referrable: (i * 2) as u32,
                })
                .collect(),
            instructions: vec![instruction(3, Opcode::PushEmpty), instruction(3, Opcode::Return)],
            starting_line: 3,
        }
    }

    #[test]
    fn test_round_trip_empty_counts() {
        let stub = stub_with_counts(0, 0, 0);
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_single_counts() {
        let stub = stub_with_counts(1, 1, 1);
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_max_counts() {
        let stub = stub_with_counts(255, 255, 255);
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_no_instructions() {
        let mut stub = stub_with_counts(0, 0, 0);
        stub.instructions.clear();
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_every_opcode() {
        let ops = vec![
            Opcode::Noop,
            Opcode::PushEmpty,
            Opcode::PushNumber(-12.75),
            Opcode::PushBoolean(true),
            Opcode::PushString(1),
            Opcode::NewObject,
            Opcode::NewFunction { file_id: 1, stub_id: 9 },
            Opcode::NewFunctionTyped { file_id: 1, stub_id: 10 },
            Opcode::PushBuiltinType(3),
            Opcode::ReferrableLoad(2),
            Opcode::ReferrableAssign {
                index: 4,
                op: AssignOp::Shl,
            },
            Opcode::MemberLoad { bracket: true },
            Opcode::MemberAssign {
                op: AssignOp::Pow,
                bracket: false,
            },
            Opcode::Call(3),
            Opcode::CallVarArg,
            Opcode::PushPrivateBinding,
            Opcode::ExternalLoad(6),
            Opcode::Skip(2),
            Opcode::SkipIfFalse(5),
            Opcode::AndSkip(1),
            Opcode::OrSkip(1),
            Opcode::Operator(OperatorCode::Diamond),
            Opcode::Listen,
            Opcode::Return,
            Opcode::Pop(2),
            Opcode::Copy,
        ];
        let mut stub = stub_with_counts(1, 1, 1);
        stub.instructions = ops
            .iter()
            .enumerate()
            .map(|(i, op)| instruction(3 + i as u32, *op))
            .collect();
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_large_instruction_stream() {
        let mut stub = stub_with_counts(0, 1, 0);
        stub.instructions = (0..10_000)
            .map(|i| instruction(3, Opcode::PushNumber(i as f64)))
            .collect();
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_round_trip_vararg_and_unicode_names() {
        let mut stub = stub_with_counts(1, 0, 0);
        stub.is_vararg = true;
        stub.arguments = vec!["données".into()];
        stub.strings = vec!["ψ∀x".into()];
        assert_eq!(round_trip(&stub), stub);
    }

    #[test]
    fn test_program_round_trip() {
        let stubs = vec![stub_with_counts(0, 0, 0), stub_with_counts(2, 1, 0)];
        let bytes = encode_program(&stubs);
        assert_eq!(decode_program(&bytes, 1).unwrap(), stubs);
    }
}
