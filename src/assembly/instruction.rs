//! Intermediate instruction representation.
//!
//! Instructions here are decoupled from byte offsets: branch operands hold the index of the
//! target instruction inside the same body. Rewriting an instruction in place therefore never
//! invalidates a branch, and a body can be re-encoded after its operands change size.

use std::fmt::{self, UpperHex};

use serde::{Deserialize, Serialize};

use crate::{
    assembly::opcodes::{self, OpCode},
    metadata::token::Token,
};

/// The encoding of an instruction's inline operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate (`ldc.i4.s`)
    Int8,
    /// Unsigned 8-bit immediate (short-form local and argument indices, `unaligned.`)
    UInt8,
    /// Unsigned 16-bit immediate (long-form local and argument indices)
    UInt16,
    /// Signed 32-bit immediate (`ldc.i4`)
    Int32,
    /// Signed 64-bit immediate (`ldc.i8`)
    Int64,
    /// 32-bit float (`ldc.r4`)
    Float32,
    /// 64-bit float (`ldc.r8`)
    Float64,
    /// Metadata token
    Token,
    /// 8-bit relative branch displacement
    ShortTarget,
    /// 32-bit relative branch displacement
    Target,
    /// Jump table: a 32-bit count followed by that many 32-bit displacements
    Switch,
}

impl OperandType {
    /// Encoded size of the operand, `None` for the variable-length switch table.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 | OperandType::ShortTarget => Some(1),
            OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token | OperandType::Target => {
                Some(4)
            }
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter block
    EndFinally,
    /// Leaves a protected region
    Leave,
}

/// An inline immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Immediate {
    /// Signed 8-bit
    Int8(i8),
    /// Unsigned 8-bit
    UInt8(u8),
    /// Unsigned 16-bit
    UInt16(u16),
    /// Signed 32-bit
    Int32(i32),
    /// Signed 64-bit
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::UInt16(value) => write!(f, "{value:04X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl From<Immediate> for u64 {
    fn from(val: Immediate) -> Self {
        match val {
            // Signed values keep their bit pattern
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int8(value) => value as u64,
            Immediate::UInt8(value) => u64::from(value),
            Immediate::UInt16(value) => u64::from(value),
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int32(value) => value as u64,
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int64(value) => value as u64,
            Immediate::Float32(value) => u64::from(value.to_bits()),
            Immediate::Float64(value) => value.to_bits(),
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand
    None,
    /// Inline immediate
    Immediate(Immediate),
    /// Metadata token (or a dynamic token before translation)
    Token(Token),
    /// Index of the branch target instruction
    Target(usize),
    /// Indices of the switch targets
    Switch(Vec<usize>),
}

impl Operand {
    /// The token carried by this operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self {
            Operand::Token(token) => Some(*token),
            _ => None,
        }
    }

    /// Branch target indices carried by this operand.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Operand::Target(index) => vec![*index],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }
}

/// A single CIL instruction.
///
/// # Examples
///
/// ```rust
/// use ilunpack::assembly::{opcodes, Instruction, Operand};
///
/// let load = Instruction::ldc_i4(3);
/// assert_eq!(load.opcode, opcodes::LDC_I4_3);
/// assert_eq!(load.ldc_i4_value(), Some(3));
///
/// let branch = Instruction::new(opcodes::BR_S, Operand::Target(0));
/// assert!(branch.is_branch());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The opcode
    pub opcode: OpCode,
    /// The operand
    #[serde(default = "no_operand", skip_serializing_if = "is_no_operand")]
    pub operand: Operand,
}

fn no_operand() -> Operand {
    Operand::None
}

fn is_no_operand(operand: &Operand) -> bool {
    matches!(operand, Operand::None)
}

impl Instruction {
    /// Create an instruction from an opcode and operand.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// Create an instruction without operand.
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction::new(opcode, Operand::None)
    }

    /// Create an instruction carrying a token.
    #[must_use]
    pub fn with_token(opcode: OpCode, token: Token) -> Self {
        Instruction::new(opcode, Operand::Token(token))
    }

    /// A `nop`.
    #[must_use]
    pub fn nop() -> Self {
        Instruction::simple(opcodes::NOP)
    }

    /// An `ldstr` loading the user string `token`.
    #[must_use]
    pub fn ldstr(token: Token) -> Self {
        Instruction::with_token(opcodes::LDSTR, token)
    }

    /// The shortest `ldc.i4` form for `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        match value {
            -1 => Instruction::simple(opcodes::LDC_I4_M1),
            0 => Instruction::simple(opcodes::LDC_I4_0),
            1 => Instruction::simple(opcodes::LDC_I4_1),
            2 => Instruction::simple(opcodes::LDC_I4_2),
            3 => Instruction::simple(opcodes::LDC_I4_3),
            4 => Instruction::simple(opcodes::LDC_I4_4),
            5 => Instruction::simple(opcodes::LDC_I4_5),
            6 => Instruction::simple(opcodes::LDC_I4_6),
            7 => Instruction::simple(opcodes::LDC_I4_7),
            8 => Instruction::simple(opcodes::LDC_I4_8),
            v if i8::try_from(v).is_ok() => Instruction::new(
                opcodes::LDC_I4_S,
                #[allow(clippy::cast_possible_truncation)]
                Operand::Immediate(Immediate::Int8(v as i8)),
            ),
            v => Instruction::new(opcodes::LDC_I4, Operand::Immediate(Immediate::Int32(v))),
        }
    }

    /// The mnemonic of the opcode.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.opcode.mnemonic()
    }

    /// The control flow effect of the opcode.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.opcode.flow()
    }

    /// Returns true for conditional, unconditional and switch branches (including `leave`).
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// The constant pushed by any `ldc.i4` variant.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        let op = self.opcode;
        if op == opcodes::LDC_I4_M1 {
            return Some(-1);
        }
        if op.prefix == 0 && (opcodes::LDC_I4_0.value..=opcodes::LDC_I4_8.value).contains(&op.value)
        {
            return Some(i32::from(op.value - opcodes::LDC_I4_0.value));
        }
        match (op, &self.operand) {
            (o, Operand::Immediate(Immediate::Int8(v))) if o == opcodes::LDC_I4_S => {
                Some(i32::from(*v))
            }
            (o, Operand::Immediate(Immediate::Int32(v))) if o == opcodes::LDC_I4 => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, " 0x{imm:X}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Target(index) => write!(f, " IL_{index:04}"),
            Operand::Switch(targets) => {
                let labels: Vec<String> = targets.iter().map(|t| format!("IL_{t:04}")).collect();
                write!(f, " ({})", labels.join(", "))
            }
        }
    }
}
