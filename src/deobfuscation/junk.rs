//! Collection of metadata that exists only for the protection.

use std::collections::BTreeSet;

use crate::metadata::token::Token;

/// One entry of a [`JunkSet`].
///
/// The variant order is the removal order: fields, then methods, then types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JunkEntry {
    /// A protection field, removed with its backing type if nothing else uses it
    Field(Token),
    /// A protection method
    Method(Token),
    /// A nested helper type
    Type(Token),
}

impl JunkEntry {
    /// The token of the entry.
    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            JunkEntry::Field(token) | JunkEntry::Method(token) | JunkEntry::Type(token) => *token,
        }
    }
}

/// Ordered, deduplicated set of entities to remove.
///
/// Filled during recovery and drained once by cleanup.
#[derive(Debug, Clone, Default)]
pub struct JunkSet {
    entries: BTreeSet<JunkEntry>,
}

impl JunkSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Returns false if it was already present.
    pub fn insert(&mut self, entry: JunkEntry) -> bool {
        self.entries.insert(entry)
    }

    /// Add a field.
    pub fn add_field(&mut self, token: Token) -> bool {
        self.insert(JunkEntry::Field(token))
    }

    /// Add a method.
    pub fn add_method(&mut self, token: Token) -> bool {
        self.insert(JunkEntry::Method(token))
    }

    /// Add a type.
    pub fn add_type(&mut self, token: Token) -> bool {
        self.insert(JunkEntry::Type(token))
    }

    /// Returns true if `entry` is in the set.
    #[must_use]
    pub fn contains(&self, entry: &JunkEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry in removal order, leaving the set empty.
    pub fn drain(&mut self) -> Vec<JunkEntry> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}
