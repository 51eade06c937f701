//! Decoding raw IL bytes into the index-based instruction form.
//!
//! Decoding runs in two passes. The first reads every instruction and records its byte offset and
//! raw branch displacement. The second maps each absolute branch target onto the index of the
//! instruction starting at that offset. A branch into the middle of an instruction, or past the
//! end of the code, is rejected as malformed.

use std::collections::HashMap;

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Operand, OperandType},
        opcodes::{self, OpCode, FE_PREFIX},
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

enum RawOperand {
    Resolved(Operand),
    Branch(i64),
    Switch(Vec<i32>),
}

struct RawInstruction {
    offset: u32,
    size: u32,
    opcode: OpCode,
    operand: RawOperand,
}

/// A decoded instruction stream together with the byte offset of each instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    /// Decoded instructions, branch operands as instruction indices
    pub instructions: Vec<Instruction>,
    /// Byte offset of each instruction in the original stream
    pub offsets: Vec<u32>,
    /// Total length of the decoded code
    pub code_size: u32,
}

impl DecodedBody {
    /// Map a byte offset onto an instruction index.
    ///
    /// The end of the code maps to `instructions.len()`, which is how exclusive region ends are
    /// expressed.
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        if offset == self.code_size {
            return Some(self.instructions.len());
        }
        self.offsets.binary_search(&offset).ok()
    }
}

fn decode_raw(parser: &mut Parser) -> Result<RawInstruction> {
    let offset = parser.pos();
    let first_byte = parser.read_le::<u8>()?;

    let info = if first_byte == FE_PREFIX {
        let second_byte = parser.read_le::<u8>()?;
        opcodes::lookup(FE_PREFIX, second_byte)
            .ok_or_else(|| malformed_error!("Invalid opcode: FE {:02X}", second_byte))?
    } else {
        opcodes::lookup(0, first_byte)
            .ok_or_else(|| malformed_error!("Invalid opcode: {:02X}", first_byte))?
    };

    let operand = match info.operand {
        OperandType::None => RawOperand::Resolved(Operand::None),
        OperandType::Int8 => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)))
        }
        OperandType::UInt8 => {
            RawOperand::Resolved(Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)))
        }
        OperandType::UInt16 => RawOperand::Resolved(Operand::Immediate(Immediate::UInt16(
            parser.read_le::<u16>()?,
        ))),
        OperandType::Int32 => RawOperand::Resolved(Operand::Immediate(Immediate::Int32(
            parser.read_le::<i32>()?,
        ))),
        OperandType::Int64 => RawOperand::Resolved(Operand::Immediate(Immediate::Int64(
            parser.read_le::<i64>()?,
        ))),
        OperandType::Float32 => RawOperand::Resolved(Operand::Immediate(Immediate::Float32(
            parser.read_le::<f32>()?,
        ))),
        OperandType::Float64 => RawOperand::Resolved(Operand::Immediate(Immediate::Float64(
            parser.read_le::<f64>()?,
        ))),
        OperandType::Token => {
            RawOperand::Resolved(Operand::Token(Token::new(parser.read_le::<u32>()?)))
        }
        OperandType::ShortTarget => RawOperand::Branch(i64::from(parser.read_le::<i8>()?)),
        OperandType::Target => RawOperand::Branch(i64::from(parser.read_le::<i32>()?)),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            // Each case needs four bytes; reject counts the stream cannot possibly hold
            if case_count > parser.len().saturating_sub(parser.pos()) / 4 {
                return Err(malformed_error!(
                    "Switch with {} cases exceeds the code size",
                    case_count
                ));
            }

            let mut targets = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                targets.push(parser.read_le::<i32>()?);
            }
            RawOperand::Switch(targets)
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    Ok(RawInstruction {
        offset: offset as u32,
        size: (parser.pos() - offset) as u32,
        opcode: info.opcode,
        operand,
    })
}

/// Decode a complete IL stream.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for reserved opcodes and invalid branch targets, and
/// [`crate::Error::OutOfBounds`] for truncated operands.
///
/// # Examples
///
/// ```rust
/// use ilunpack::assembly::{decode_stream, opcodes, Operand};
///
/// // br.s +1; nop; ret
/// let body = decode_stream(&[0x2B, 0x01, 0x00, 0x2A])?;
/// assert_eq!(body.instructions.len(), 3);
/// assert_eq!(body.instructions[0].operand, Operand::Target(2));
/// assert_eq!(body.instructions[2].opcode, opcodes::RET);
/// # Ok::<(), ilunpack::Error>(())
/// ```
pub fn decode_stream(code: &[u8]) -> Result<DecodedBody> {
    let mut parser = Parser::new(code);
    let mut raw = Vec::new();
    while parser.has_more_data() {
        raw.push(decode_raw(&mut parser)?);
    }

    let index: HashMap<i64, usize> = raw
        .iter()
        .enumerate()
        .map(|(i, insn)| (i64::from(insn.offset), i))
        .collect();
    #[allow(clippy::cast_possible_truncation)]
    let code_size = code.len() as u32;

    let resolve = |from: &RawInstruction, displacement: i64| -> Result<usize> {
        let target = i64::from(from.offset) + i64::from(from.size) + displacement;
        index.get(&target).copied().ok_or_else(|| {
            malformed_error!(
                "Branch at IL_{:04x} targets 0x{:x}, which is not an instruction boundary",
                from.offset,
                target
            )
        })
    };

    let mut instructions = Vec::with_capacity(raw.len());
    for insn in &raw {
        let operand = match &insn.operand {
            RawOperand::Resolved(operand) => operand.clone(),
            RawOperand::Branch(displacement) => Operand::Target(resolve(insn, *displacement)?),
            RawOperand::Switch(displacements) => Operand::Switch(
                displacements
                    .iter()
                    .map(|d| resolve(insn, i64::from(*d)))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        instructions.push(Instruction::new(insn.opcode, operand));
    }

    Ok(DecodedBody {
        instructions,
        offsets: raw.iter().map(|insn| insn.offset).collect(),
        code_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn decode_simple_stream() {
        // ldsfld 0x04000001; ldc.i4.3; call 0x06000002; ret
        let code = [
            0x7E, 0x01, 0x00, 0x00, 0x04, 0x19, 0x28, 0x02, 0x00, 0x00, 0x06, 0x2A,
        ];
        let body = decode_stream(&code).unwrap();
        assert_eq!(body.instructions.len(), 4);
        assert_eq!(body.offsets, vec![0, 5, 6, 11]);
        assert_eq!(
            body.instructions[0].operand,
            Operand::Token(Token::new(0x04000001))
        );
        assert_eq!(body.instructions[1].ldc_i4_value(), Some(3));
        assert_eq!(body.index_of(11), Some(3));
        assert_eq!(body.index_of(12), Some(4));
        assert_eq!(body.index_of(3), None);
    }

    #[test]
    fn decode_backward_branch() {
        // nop; br.s -3 (back to nop)
        let body = decode_stream(&[0x00, 0x2B, 0xFD]).unwrap();
        assert_eq!(body.instructions[1].operand, Operand::Target(0));
    }

    #[test]
    fn decode_switch() {
        // switch (2 cases: +0, +1); nop; ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x2A,
        ];
        let body = decode_stream(&code).unwrap();
        assert_eq!(body.instructions[0].operand, Operand::Switch(vec![1, 2]));
    }

    #[test]
    fn decode_two_byte_opcode() {
        // ldarg 0x0001; ceq
        let body = decode_stream(&[0xFE, 0x09, 0x01, 0x00, 0xFE, 0x01]).unwrap();
        assert_eq!(body.instructions[0].opcode, opcodes::LDARG);
        assert_eq!(
            body.instructions[0].operand,
            Operand::Immediate(Immediate::UInt16(1))
        );
        assert_eq!(body.instructions[1].opcode, opcodes::CEQ);
    }

    #[test]
    fn reject_reserved_opcode() {
        assert!(matches!(
            decode_stream(&[0x24]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            decode_stream(&[0xFE, 0x08]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn reject_branch_into_instruction() {
        // br.s +1 lands inside the ldc.i4 operand
        let code = [0x2B, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x2A];
        assert!(matches!(
            decode_stream(&code),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn reject_truncated_operand() {
        assert!(matches!(
            decode_stream(&[0x28, 0x01, 0x00]),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn reject_oversized_switch() {
        let code = [0x45, 0xFF, 0xFF, 0xFF, 0x0F];
        assert!(matches!(
            decode_stream(&code),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn decode_empty() {
        let body = decode_stream(&[]).unwrap();
        assert!(body.instructions.is_empty());
        assert_eq!(body.index_of(0), Some(0));
    }
}
