//! Metadata tokens and the tables they index.
//!
//! A token is a 32-bit value: the high byte names the table, the low 24 bits the row (RID).
//! Inside a materialized dynamic method the same layout is reused, with the low 24 bits indexing
//! the method's private token list instead of a metadata table.
//!
//! # Examples
//!
//! ```rust
//! use ilunpack::metadata::token::{TableId, Token};
//!
//! let token = Token::new(0x06000001);
//! assert_eq!(token.table(), 0x06);
//! assert_eq!(token.row(), 1);
//! assert!(token.is_table(TableId::MethodDef));
//! assert_eq!(Token::from_parts(TableId::Field, 7), Token::new(0x04000007));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// The metadata tables and heaps a [`Token`] can refer to.
///
/// Only the tables the unpacker reads or writes are listed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumIter)]
#[repr(u8)]
pub enum TableId {
    /// `TypeRef` (0x01) - types imported from other assemblies
    TypeRef = 0x01,
    /// `TypeDef` (0x02) - types defined in this container
    TypeDef = 0x02,
    /// `Field` (0x04)
    Field = 0x04,
    /// `MethodDef` (0x06)
    MethodDef = 0x06,
    /// `MemberRef` (0x0A) - methods and fields of imported types
    MemberRef = 0x0A,
    /// `StandAloneSig` (0x11) - local variable and call-site signatures
    StandAloneSig = 0x11,
    /// `TypeSpec` (0x1B)
    TypeSpec = 0x1B,
    /// `ModuleRef` (0x1A)
    ModuleRef = 0x1A,
    /// `AssemblyRef` (0x23)
    AssemblyRef = 0x23,
    /// `MethodSpec` (0x2B)
    MethodSpec = 0x2B,
    /// The user string heap (0x70), used by `ldstr`
    UserString = 0x70,
}

impl TableId {
    /// Map a token's table byte back to a [`TableId`].
    #[must_use]
    pub fn from_byte(value: u8) -> Option<TableId> {
        match value {
            0x01 => Some(TableId::TypeRef),
            0x02 => Some(TableId::TypeDef),
            0x04 => Some(TableId::Field),
            0x06 => Some(TableId::MethodDef),
            0x0A => Some(TableId::MemberRef),
            0x11 => Some(TableId::StandAloneSig),
            0x1A => Some(TableId::ModuleRef),
            0x1B => Some(TableId::TypeSpec),
            0x23 => Some(TableId::AssemblyRef),
            0x2B => Some(TableId::MethodSpec),
            0x70 => Some(TableId::UserString),
            _ => None,
        }
    }
}

/// A metadata token.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u32);

impl Token {
    /// Create a new token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Compose a token from a table and a row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw 32-bit value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The row (or list index for dynamic tokens).
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if the token points into `table`.
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }

    /// Returns true for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_token_parts() {
        let token = Token(0x06000001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);

        let token = Token(0x06FFFFFF);
        assert_eq!(token.row(), 0x00FFFFFF);
    }

    #[test]
    fn test_token_from_parts() {
        assert_eq!(
            Token::from_parts(TableId::TypeDef, 1),
            Token::new(0x02000001)
        );
        assert_eq!(
            Token::from_parts(TableId::UserString, 0x1234),
            Token::new(0x70001234)
        );
        // Rows wider than 24 bits are truncated rather than bleeding into the table byte
        assert_eq!(
            Token::from_parts(TableId::Field, 0x0100_0002),
            Token::new(0x04000002)
        );
    }

    #[test]
    fn test_token_is_table() {
        let token = Token::new(0x0A000010);
        assert!(token.is_table(TableId::MemberRef));
        assert!(!token.is_table(TableId::MethodDef));
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token(0).is_null());
        assert!(!Token(0x06000001).is_null());
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", Token(0x06000001)), "0x06000001");
        assert_eq!(format!("{}", Token(0)), "0x00000000");
    }

    #[test]
    fn test_token_debug() {
        let debug_str = format!("{:?}", Token(0x06000001));
        assert!(debug_str.contains("Token(0x06000001"));
        assert!(debug_str.contains("table: 0x06"));
        assert!(debug_str.contains("row: 1"));
    }

    #[test]
    fn test_token_hash() {
        let mut set = HashSet::new();
        set.insert(Token(0x06000001));
        set.insert(Token(0x06000001));
        set.insert(Token(0x04000001));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_token_ordering() {
        let mut tokens = vec![Token(0x06000003), Token(0x02000001), Token(0x06000001)];
        tokens.sort();
        assert_eq!(
            tokens,
            vec![Token(0x02000001), Token(0x06000001), Token(0x06000003)]
        );
    }

    #[test]
    fn test_table_id_roundtrip_byte() {
        for table in TableId::iter() {
            assert_eq!(TableId::from_byte(table as u8), Some(table));
        }
        assert_eq!(TableId::from_byte(0x03), None);
    }

    #[test]
    fn test_token_serializes_as_number() {
        let json = serde_json::to_string(&Token(0x06000001)).unwrap();
        assert_eq!(json, "100663297");
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Token(0x06000001));
    }
}
