//! CIL instructions: opcode table, decoder and encoder (ECMA-335 Partition III).
//!
//! Instructions use an index-based form, see [`Instruction`]. [`decode_stream`] turns raw IL
//! into that form and [`encode_stream`] turns it back into bytes.
//!
//! # Examples
//!
//! ```rust
//! use ilunpack::assembly::{decode_stream, encode_stream};
//!
//! let code = [0x00, 0x2B, 0xFD]; // nop; br.s -3
//! let decoded = decode_stream(&code)?;
//! assert_eq!(encode_stream(&decoded.instructions)?.code, code);
//! # Ok::<(), ilunpack::Error>(())
//! ```

mod decoder;
mod encoder;
mod instruction;
pub mod opcodes;

pub use decoder::{decode_stream, DecodedBody};
pub use encoder::{encode_stream, EncodedBody};
pub use instruction::{FlowType, Immediate, Instruction, Operand, OperandType};
pub use opcodes::OpCode;
