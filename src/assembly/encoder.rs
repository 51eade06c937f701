//! Encoding index-based instructions back into IL bytes.
//!
//! Offsets are laid out first, since every opcode has a fixed size for a given operand. Branch
//! displacements are then computed against the laid-out offsets. Short branch forms must fit
//! their 8-bit displacement; the encoder never silently widens or narrows an opcode.

use crate::{
    assembly::instruction::{Immediate, Instruction, Operand, OperandType},
    file::io::write_le,
    Result,
};

/// Encoded IL together with the byte offset of each instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    /// The IL bytes
    pub code: Vec<u8>,
    /// Byte offset of each instruction, followed by the total code size
    pub offsets: Vec<u32>,
}

impl EncodedBody {
    /// Byte offset of instruction `index`, where `index == len` is the end of the code.
    #[must_use]
    pub fn offset_of(&self, index: usize) -> Option<u32> {
        self.offsets.get(index).copied()
    }
}

fn encoded_size(insn: &Instruction) -> Result<usize> {
    let operand = match insn.opcode.operand_type() {
        OperandType::Switch => match &insn.operand {
            Operand::Switch(targets) => 4 + 4 * targets.len(),
            other => {
                return Err(malformed_error!(
                    "switch requires a target list, found {:?}",
                    other
                ))
            }
        },
        fixed => fixed.size().unwrap_or(0),
    };
    Ok(insn.opcode.size() + operand)
}

fn immediate_mismatch(insn: &Instruction) -> crate::Error {
    malformed_error!(
        "Operand {:?} does not match the encoding of {}",
        insn.operand,
        insn.opcode
    )
}

/// Encode an instruction stream.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an operand does not match its opcode, a branch target
/// is out of range, or a short branch displacement does not fit in 8 bits.
///
/// # Examples
///
/// ```rust
/// use ilunpack::assembly::{encode_stream, opcodes, Instruction, Operand};
///
/// let body = encode_stream(&[
///     Instruction::new(opcodes::BR_S, Operand::Target(2)),
///     Instruction::nop(),
///     Instruction::simple(opcodes::RET),
/// ])?;
/// assert_eq!(body.code, vec![0x2B, 0x01, 0x00, 0x2A]);
/// # Ok::<(), ilunpack::Error>(())
/// ```
pub fn encode_stream(instructions: &[Instruction]) -> Result<EncodedBody> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut position = 0usize;
    for insn in instructions {
        offsets.push(u32::try_from(position).map_err(|_| malformed_error!("Code too large"))?);
        position += encoded_size(insn)?;
    }
    offsets.push(u32::try_from(position).map_err(|_| malformed_error!("Code too large"))?);

    let displacement = |from: usize, target: usize| -> Result<i64> {
        let target_offset = offsets.get(target).ok_or_else(|| {
            malformed_error!(
                "Branch at instruction {} targets {}, past the end of the body",
                from,
                target
            )
        })?;
        Ok(i64::from(*target_offset) - i64::from(offsets[from + 1]))
    };

    let mut code = Vec::with_capacity(position);
    for (index, insn) in instructions.iter().enumerate() {
        if insn.opcode.info().is_none() {
            return Err(malformed_error!("Reserved opcode {:?}", insn.opcode));
        }
        if insn.opcode.size() == 2 {
            code.push(insn.opcode.prefix);
        }
        code.push(insn.opcode.value);

        match (insn.opcode.operand_type(), &insn.operand) {
            (OperandType::None, Operand::None) => {}
            (OperandType::Int8, Operand::Immediate(Immediate::Int8(v))) => write_le(&mut code, *v),
            (OperandType::UInt8, Operand::Immediate(Immediate::UInt8(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::UInt16, Operand::Immediate(Immediate::UInt16(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::Int32, Operand::Immediate(Immediate::Int32(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::Int64, Operand::Immediate(Immediate::Int64(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::Float32, Operand::Immediate(Immediate::Float32(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::Float64, Operand::Immediate(Immediate::Float64(v))) => {
                write_le(&mut code, *v);
            }
            (OperandType::Token, Operand::Token(token)) => write_le(&mut code, token.value()),
            (OperandType::ShortTarget, Operand::Target(target)) => {
                let delta = displacement(index, *target)?;
                let short = i8::try_from(delta).map_err(|_| {
                    malformed_error!(
                        "Short branch at instruction {} cannot reach {} ({} bytes)",
                        index,
                        target,
                        delta
                    )
                })?;
                write_le(&mut code, short);
            }
            (OperandType::Target, Operand::Target(target)) => {
                let delta = displacement(index, *target)?;
                let long = i32::try_from(delta)
                    .map_err(|_| malformed_error!("Branch displacement {} overflows", delta))?;
                write_le(&mut code, long);
            }
            (OperandType::Switch, Operand::Switch(targets)) => {
                let count = u32::try_from(targets.len())
                    .map_err(|_| malformed_error!("Switch table too large"))?;
                write_le(&mut code, count);
                for target in targets {
                    let delta = displacement(index, *target)?;
                    let long = i32::try_from(delta)
                        .map_err(|_| malformed_error!("Switch displacement {} overflows", delta))?;
                    write_le(&mut code, long);
                }
            }
            _ => return Err(immediate_mismatch(insn)),
        }
    }

    Ok(EncodedBody { code, offsets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_stream, opcodes},
        metadata::token::Token,
        Error,
    };

    #[test]
    fn encode_branches_and_tokens() {
        let instructions = vec![
            Instruction::simple(opcodes::LDARG_0),
            Instruction::new(opcodes::BRTRUE_S, Operand::Target(4)),
            Instruction::with_token(opcodes::LDSTR, Token::new(0x70000001)),
            Instruction::new(opcodes::BR, Operand::Target(5)),
            Instruction::ldc_i4(1000),
            Instruction::simple(opcodes::RET),
        ];
        let encoded = encode_stream(&instructions).unwrap();
        assert_eq!(encoded.offsets, vec![0, 1, 3, 8, 13, 18, 19]);

        let decoded = decode_stream(&encoded.code).unwrap();
        assert_eq!(decoded.instructions, instructions);
        assert_eq!(decoded.offsets, &encoded.offsets[..6]);
    }

    #[test]
    fn encode_switch_backwards() {
        let instructions = vec![
            Instruction::nop(),
            Instruction::new(opcodes::SWITCH, Operand::Switch(vec![0, 2])),
            Instruction::simple(opcodes::RET),
        ];
        let encoded = encode_stream(&instructions).unwrap();
        // next offset is 1 + 13 = 14; target 0 is -14, target 2 is +0
        assert_eq!(&encoded.code[6..10], &(-14i32).to_le_bytes());
        assert_eq!(&encoded.code[10..14], &0i32.to_le_bytes());
    }

    #[test]
    fn reject_short_branch_out_of_range() {
        let mut instructions = vec![Instruction::new(opcodes::BR_S, Operand::Target(200))];
        instructions.extend((0..200).map(|_| Instruction::nop()));
        assert!(matches!(
            encode_stream(&instructions),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn reject_target_past_end() {
        let instructions = vec![Instruction::new(opcodes::BR, Operand::Target(5))];
        assert!(matches!(
            encode_stream(&instructions),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn reject_operand_mismatch() {
        let bad = Instruction::new(opcodes::LDC_I4_S, Operand::Immediate(Immediate::Int32(5)));
        assert!(matches!(
            encode_stream(&[bad]),
            Err(Error::Malformed { .. })
        ));
    }
}
