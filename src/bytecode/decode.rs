//! Binary stub decoding.

use crate::error::LoadError;

use super::opcode::{AssignOp, Instruction, Opcode, OperatorCode};
use super::stub::{Capture, Stub};

/// Leading tag of every encoded stub.
pub const MAGIC: [u8; 6] = [b'M', b'A', b'T', 0x01, 0x06, b'B'];

/// Format version this decoder understands.
pub const VERSION: u8 = 1;

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], LoadError> {
        let end = self.offset.checked_add(count).filter(|e| *e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.offset..end];
                self.offset = end;
                Ok(slice)
            }
            None => Err(LoadError::unexpected_eof(self.offset)),
        }
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, LoadError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Length-prefixed UTF-32 string: `len: u32` then `len` codepoints,
    /// one `i32` each.
    fn read_utf32_string(&mut self) -> Result<Box<str>, LoadError> {
        let len = self.read_u32()? as usize;
        // The length comes from the wire; a declared count beyond what the
        // remaining bytes can hold must not drive the reserve.
        let mut out = String::with_capacity(len.min(self.remaining() / 4));
        for _ in 0..len {
            let at = self.offset;
            let raw = self.read_u32()?;
            match char::from_u32(raw) {
                Some(c) => out.push(c),
                None => return Err(LoadError::invalid_codepoint(raw, at)),
            }
        }
        Ok(out.into_boxed_str())
    }
}

/// Decode a single stub from the front of `bytes`, tagging it with
/// `file_id`. Returns the stub and the number of bytes consumed.
///
/// Malformed input is an error; there is no degenerate-stub fallback, so a
/// bad magic tag or version surfaces to the caller instead of producing a
/// stub that silently does nothing.
pub fn decode_stub(bytes: &[u8], file_id: u32) -> Result<(Stub, usize), LoadError> {
    let mut reader = Reader::new(bytes);

    let magic_at = reader.offset;
    let magic = reader.read_bytes(MAGIC.len())?;
    if magic != MAGIC {
        return Err(LoadError::bad_magic(magic_at));
    }
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let stub_id = reader.read_u32()?;
    let is_vararg = reader.read_u8()? != 0;

    let arg_count = reader.read_u8()?;
    let mut arguments = Vec::with_capacity(arg_count as usize);
    for _ in 0..arg_count {
        arguments.push(reader.read_utf32_string()?);
    }

    let local_count = reader.read_u8()?;
    let mut locals = Vec::with_capacity(local_count as usize);
    for _ in 0..local_count {
        locals.push(reader.read_utf32_string()?);
    }

    let string_count = reader.read_u32()?;
    // Each pool string needs at least its 4-byte length prefix.
    let string_cap = (string_count as usize).min(reader.remaining() / 4);
    let mut strings = Vec::with_capacity(string_cap);
    for _ in 0..string_count {
        strings.push(reader.read_utf32_string()?);
    }

    let captured_count = reader.read_u16()?;
    let mut captures = Vec::with_capacity(captured_count as usize);
    for _ in 0..captured_count {
        let stub_id = reader.read_u32()?;
        let referrable = reader.read_u32()?;
        captures.push(Capture { stub_id, referrable });
    }

    let instruction_count = reader.read_u32()?;
    let starting_line = reader.read_u32()?;
    // An instruction occupies 11 wire bytes: offset, opcode, data.
    let instruction_cap = (instruction_count as usize).min(reader.remaining() / 11);
    let mut instructions = Vec::with_capacity(instruction_cap);
    for _ in 0..instruction_count {
        let line_offset = reader.read_u16()?;
        let opcode_at = reader.offset;
        let opcode = reader.read_u8()?;
        let data_bytes = reader.read_bytes(8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(data_bytes);
        let op = decode_instruction(opcode, data, opcode_at, file_id)?;
        instructions.push(Instruction {
            // The encoder saturates the offset; reconstruction mirrors it
            // rather than overflowing on a hostile pair.
            line: starting_line.saturating_add(u32::from(line_offset)),
            op,
        });
    }

    Ok((
        Stub {
            file_id,
            stub_id,
            is_vararg,
            arguments,
            locals,
            strings,
            captures,
            instructions,
            starting_line,
        },
        reader.offset,
    ))
}

/// Decode a whole compiled unit: stubs concatenated back to back until the
/// input is exhausted.
pub fn decode_program(bytes: &[u8], file_id: u32) -> Result<Vec<Stub>, LoadError> {
    let mut stubs = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (stub, used) = decode_stub(&bytes[pos..], file_id)?;
        stubs.push(stub);
        pos += used;
    }
    Ok(stubs)
}

fn data_u32(data: &[u8; 8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn decode_instruction(
    opcode: u8,
    data: [u8; 8],
    at: usize,
    file_id: u32,
) -> Result<Opcode, LoadError> {
    Ok(match opcode {
        0 => Opcode::Noop,
        1 => Opcode::PushEmpty,
        2 => Opcode::PushNumber(f64::from_le_bytes(data)),
        3 => Opcode::PushBoolean(data[0] != 0),
        4 => Opcode::PushString(data_u32(&data)),
        5 => Opcode::NewObject,
        6 => Opcode::NewFunction {
            file_id,
            stub_id: data_u32(&data),
        },
        7 => Opcode::NewFunctionTyped {
            file_id,
            stub_id: data_u32(&data),
        },
        8 => {
            let code = data[0];
            if u32::from(code) >= crate::store::TypeId::BUILTIN_COUNT {
                return Err(LoadError::invalid_payload(
                    "built-in type",
                    at,
                    "type code out of range",
                ));
            }
            Opcode::PushBuiltinType(code)
        }
        9 => Opcode::ReferrableLoad(data_u32(&data)),
        10 => {
            let op = AssignOp::from_byte(data[4]).ok_or_else(|| {
                LoadError::invalid_payload("assignment", at, "unknown assignment operator")
            })?;
            Opcode::ReferrableAssign {
                index: data_u32(&data),
                op,
            }
        }
        11 => Opcode::MemberLoad {
            bracket: data[0] != 0,
        },
        12 => {
            let op = AssignOp::from_byte(data[0]).ok_or_else(|| {
                LoadError::invalid_payload("assignment", at, "unknown assignment operator")
            })?;
            Opcode::MemberAssign {
                op,
                bracket: data[1] != 0,
            }
        }
        13 => Opcode::Call(data_u32(&data)),
        14 => Opcode::CallVarArg,
        15 => Opcode::PushPrivateBinding,
        16 => Opcode::ExternalLoad(data_u32(&data)),
        17 => Opcode::Skip(data_u32(&data)),
        18 => Opcode::SkipIfFalse(data_u32(&data)),
        19 => Opcode::AndSkip(data_u32(&data)),
        20 => Opcode::OrSkip(data_u32(&data)),
        21 => {
            let code = OperatorCode::from_byte(data[0]).ok_or_else(|| {
                LoadError::invalid_payload("operator", at, "unknown operator code")
            })?;
            Opcode::Operator(code)
        }
        22 => Opcode::Listen,
        23 => Opcode::Return,
        24 => Opcode::Pop(data_u32(&data)),
        25 => Opcode::Copy,
        other => return Err(LoadError::unknown_opcode(other, at)),
    })
}
