//! Exception handler regions of method bodies.
//!
//! Two forms exist. [`ExceptionHandler`] is the editable form, with region bounds expressed as
//! instruction indices like every other branch target in a [`crate::metadata::method::MethodBody`].
//! [`ExceptionClause`] is the byte-offset form found in an extra data section after the IL
//! (ECMA-335 II.25.4.6), which is what a materialized dynamic method hands back.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    file::{io::write_le, parser::Parser},
    metadata::token::Token,
    Result,
};

bitflags! {
    /// Kind of an exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed catch clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// A fault clause
        const FAULT = 0x0004;
    }
}

bitflags! {
    /// Flags of an extra method data section header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        /// The section holds exception handling clauses
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// The section uses the fat (24-byte clause) layout
        const FAT_FORMAT = 0x40;
        /// Another section follows this one
        const MORE_SECTS = 0x80;
    }
}

/// A protected region with its handler, bounds as instruction indices.
///
/// Every `*_end` bound is exclusive and may equal the instruction count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
    /// First filter instruction, for [`ExceptionHandlerFlags::FILTER`] clauses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_start: Option<usize>,
    /// Caught exception type, for [`ExceptionHandlerFlags::EXCEPTION`] clauses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_type: Option<Token>,
}

impl ExceptionHandler {
    /// Every instruction index this clause refers to, starts and exclusive ends alike.
    #[must_use]
    pub fn bounds(&self) -> Vec<usize> {
        let mut bounds = vec![
            self.try_start,
            self.try_end,
            self.handler_start,
            self.handler_end,
        ];
        bounds.extend(self.filter_start);
        bounds
    }
}

/// An exception clause in its encoded, byte-offset form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionClause {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// Byte offset of the protected region
    pub try_offset: u32,
    /// Byte length of the protected region
    pub try_length: u32,
    /// Byte offset of the handler
    pub handler_offset: u32,
    /// Byte length of the handler
    pub handler_length: u32,
    /// Class token for typed catch clauses, filter offset for filter clauses, 0 otherwise
    pub class_or_filter: u32,
}

/// Parse a sequence of exception handling data sections.
///
/// Both small and fat sections are accepted; sections not flagged as exception tables end the
/// sequence.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a section header announces more data than available.
pub fn parse_exception_sections(data: &[u8]) -> Result<Vec<ExceptionClause>> {
    let mut clauses = Vec::new();
    let mut parser = Parser::new(data);

    while parser.has_more_data() {
        parser.align(4)?;
        if !parser.has_more_data() {
            break;
        }

        let section_start = parser.pos();
        let flags = SectionFlags::from_bits_truncate(parser.read_le::<u8>()?);
        if !flags.contains(SectionFlags::EHTABLE) {
            break;
        }

        if flags.contains(SectionFlags::FAT_FORMAT) {
            let b0 = u32::from(parser.read_le::<u8>()?);
            let b1 = u32::from(parser.read_le::<u8>()?);
            let b2 = u32::from(parser.read_le::<u8>()?);
            let size = (b2 << 16) | (b1 << 8) | b0;
            if size < 4 || section_start + size as usize > data.len() {
                return Err(malformed_error!("Fat EH section of {} bytes is truncated", size));
            }

            for _ in 0..(size - 4) / 24 {
                #[allow(clippy::cast_possible_truncation)]
                clauses.push(ExceptionClause {
                    flags: ExceptionHandlerFlags::from_bits_truncate(
                        parser.read_le::<u32>()? as u16,
                    ),
                    try_offset: parser.read_le::<u32>()?,
                    try_length: parser.read_le::<u32>()?,
                    handler_offset: parser.read_le::<u32>()?,
                    handler_length: parser.read_le::<u32>()?,
                    class_or_filter: parser.read_le::<u32>()?,
                });
            }
            parser.seek(section_start + size as usize)?;
        } else {
            let size = u32::from(parser.read_le::<u8>()?);
            let _reserved = parser.read_le::<u16>()?;
            if size < 4 || section_start + size as usize > data.len() {
                return Err(malformed_error!("Small EH section of {} bytes is truncated", size));
            }

            for _ in 0..(size - 4) / 12 {
                clauses.push(ExceptionClause {
                    flags: ExceptionHandlerFlags::from_bits_truncate(parser.read_le::<u16>()?),
                    try_offset: u32::from(parser.read_le::<u16>()?),
                    try_length: u32::from(parser.read_le::<u8>()?),
                    handler_offset: u32::from(parser.read_le::<u16>()?),
                    handler_length: u32::from(parser.read_le::<u8>()?),
                    class_or_filter: parser.read_le::<u32>()?,
                });
            }
            parser.seek(section_start + size as usize)?;
        }

        if !flags.contains(SectionFlags::MORE_SECTS) {
            break;
        }
    }

    Ok(clauses)
}

/// Encode clauses as a single fat exception handling section.
///
/// Returns an empty vector when there are no clauses.
#[must_use]
pub fn encode_exception_section(clauses: &[ExceptionClause]) -> Vec<u8> {
    if clauses.is_empty() {
        return Vec::new();
    }

    let size = 4 + 24 * clauses.len();
    let mut out = Vec::with_capacity(size);
    out.push((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&[size as u8, (size >> 8) as u8, (size >> 16) as u8]);
    for clause in clauses {
        write_le(&mut out, u32::from(clause.flags.bits()));
        write_le(&mut out, clause.try_offset);
        write_le(&mut out, clause.try_length);
        write_le(&mut out, clause.handler_offset);
        write_le(&mut out, clause.handler_length);
        write_le(&mut out, clause.class_or_filter);
    }
    out
}
