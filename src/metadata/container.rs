//! The in-memory container model.
//!
//! A [`Container`] holds the parts of a managed executable the unpacker reads and rewrites:
//!
//! - the type system (type definitions with their nested types, fields and methods),
//! - the reference tables a materialized method body can point into (assembly, type and
//!   member references, user strings, standalone signatures),
//! - embedded resources and the native image data that mixed-mode images carry.
//!
//! Tables are stored flat and keyed by [`Token`], the way they sit in the metadata. Types list
//! the tokens of their members; members point back at their declaring type.
//!
//! # Examples
//!
//! ```rust
//! use ilunpack::metadata::{Container, ImageKind, MethodAttributes, FieldAttributes};
//!
//! let mut container = Container::new("Sample.exe", ImageKind::IlOnly);
//! let global = container.global_type_token();
//! let field = container.add_field(global, "Invoke", FieldAttributes::STATIC, None);
//! let method = container.add_method(global, "a", MethodAttributes::STATIC, None);
//!
//! assert_eq!(container.field(field).unwrap().name, "Invoke");
//! assert_eq!(container.method_full_name(method), "<Module>::a");
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    assembly::Operand,
    metadata::{
        method::MethodBody,
        token::{TableId, Token},
    },
};

/// Name of the module-level type every container has.
pub const GLOBAL_TYPE_NAME: &str = "<Module>";

bitflags! {
    /// Subset of `TypeAttributes` (ECMA-335 II.23.1.15) used by the unpacker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TypeAttributes: u32 {
        /// Visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Nested, public
        const NESTED_PUBLIC = 0x0000_0002;
        /// Nested, private
        const NESTED_PRIVATE = 0x0000_0003;
        /// Interface
        const INTERFACE = 0x0000_0020;
        /// Abstract
        const ABSTRACT = 0x0000_0080;
        /// Sealed
        const SEALED = 0x0000_0100;
        /// Special name
        const SPECIAL_NAME = 0x0000_0400;
        /// Call the type initializer lazily
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    /// Subset of `FieldAttributes` (ECMA-335 II.23.1.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FieldAttributes: u16 {
        /// Accessible only by the declaring type
        const PRIVATE = 0x0001;
        /// Accessible by the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// Static field
        const STATIC = 0x0010;
        /// Read-only after initialization
        const INIT_ONLY = 0x0020;
        /// Compile-time constant
        const LITERAL = 0x0040;
    }
}

bitflags! {
    /// Subset of `MethodAttributes` (ECMA-335 II.23.1.10).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MethodAttributes: u16 {
        /// Accessible only by the declaring type
        const PRIVATE = 0x0001;
        /// Accessible by the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// Static method
        const STATIC = 0x0010;
        /// Virtual method
        const VIRTUAL = 0x0040;
        /// Hide by signature
        const HIDE_BY_SIG = 0x0080;
        /// Special name
        const SPECIAL_NAME = 0x0800;
        /// Implemented through platform invoke
        const PINVOKE_IMPL = 0x2000;
        /// Runtime special name (`.ctor`, `.cctor`)
        const RT_SPECIAL_NAME = 0x1000;
    }
}

impl MethodAttributes {
    const MEMBER_ACCESS_MASK: u16 = 0x0007;

    /// Returns true if the access level is exactly `private`.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.bits() & Self::MEMBER_ACCESS_MASK == Self::PRIVATE.bits()
    }
}

/// Whether the image holds only metadata and IL, or native code and sections as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    /// IL-only image (`COMIMAGE_FLAGS_ILONLY`)
    IlOnly,
    /// Mixed-mode image with native code
    Native,
}

/// A native section carried by mixed-mode images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSection {
    /// Section name
    pub name: String,
    /// Raw section contents
    pub data: Vec<u8>,
}

/// Type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Token in the `TypeDef` table
    pub token: Token,
    /// Namespace, empty for nested and global types
    #[serde(default)]
    pub namespace: String,
    /// Type name
    pub name: String,
    /// Attributes
    pub flags: TypeAttributes,
    /// Base type (`TypeDef` or `TypeRef`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<Token>,
    /// Declaring type for nested types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosing: Option<Token>,
    /// Owned fields
    #[serde(default)]
    pub fields: Vec<Token>,
    /// Owned methods
    #[serde(default)]
    pub methods: Vec<Token>,
    /// Nested types
    #[serde(default)]
    pub nested_types: Vec<Token>,
}

/// Field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Token in the `Field` table
    pub token: Token,
    /// Field name
    pub name: String,
    /// Attributes
    pub flags: FieldAttributes,
    /// Declaring type
    pub declaring_type: Token,
    /// Class of the field, when it is a `TypeDef` or `TypeRef`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<Token>,
}

/// Platform-invoke binding of a method (ImplMap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplMap {
    /// Name of the native module
    pub module: String,
    /// Imported entry point
    pub entry_point: String,
}

/// Method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Token in the `MethodDef` table
    pub token: Token,
    /// Method name
    pub name: String,
    /// Attributes
    pub flags: MethodAttributes,
    /// Declaring type
    pub declaring_type: Token,
    /// Method signature blob
    #[serde(default)]
    pub signature: Vec<u8>,
    /// Native binding for P/Invoke methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impl_map: Option<ImplMap>,
    /// IL body, `None` for abstract, runtime and P/Invoke methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MethodBody>,
}

/// Reference to another assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyRef {
    /// Token in the `AssemblyRef` table
    pub token: Token,
    /// Simple name
    pub name: String,
    /// Version as `major.minor.build.revision`
    pub version: String,
    /// Culture, empty for neutral
    #[serde(default)]
    pub culture: String,
    /// Hex-encoded public key token, empty if unsigned
    #[serde(default)]
    pub public_key_token: String,
}

impl AssemblyRef {
    /// Display name in the `Name, Version=..., Culture=..., PublicKeyToken=...` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        let culture = if self.culture.is_empty() {
            "neutral"
        } else {
            &self.culture
        };
        let key = if self.public_key_token.is_empty() {
            "null"
        } else {
            &self.public_key_token
        };
        format!(
            "{}, Version={}, Culture={}, PublicKeyToken={}",
            self.name, self.version, culture, key
        )
    }
}

/// Reference to a type in another assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    /// Token in the `TypeRef` table
    pub token: Token,
    /// Resolution scope (`AssemblyRef` or enclosing `TypeRef`)
    pub scope: Token,
    /// Namespace
    #[serde(default)]
    pub namespace: String,
    /// Type name
    pub name: String,
}

/// Reference to a method or field of a referenced type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    /// Token in the `MemberRef` table
    pub token: Token,
    /// Parent type (`TypeRef`, `TypeDef` or `TypeSpec`)
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Member signature blob
    #[serde(default)]
    pub signature: Vec<u8>,
}

/// An entry of the user string heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserString {
    /// `0x70` token addressing the string
    pub token: Token,
    /// The string value
    pub value: String,
}

/// A standalone signature (locals or call site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandAloneSig {
    /// Token in the `StandAloneSig` table
    pub token: Token,
    /// Signature blob
    pub blob: Vec<u8>,
}

/// An embedded manifest resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name
    pub name: String,
    /// Whether the resource is public
    #[serde(default)]
    pub public: bool,
    /// Resource contents
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A loaded container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Module name, e.g. `Sample.exe`
    pub name: String,
    /// Image kind of the file the container was loaded from
    pub image_kind: ImageKind,
    /// Native sections of mixed-mode images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub native_sections: Vec<NativeSection>,
    /// Win32 resource directory of mixed-mode images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win32_resources: Option<Vec<u8>>,
    /// Type definitions, the global type first
    pub types: Vec<TypeDef>,
    /// Field definitions
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Method definitions
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    /// Assembly references
    #[serde(default)]
    pub assembly_refs: Vec<AssemblyRef>,
    /// Type references
    #[serde(default)]
    pub type_refs: Vec<TypeRef>,
    /// Member references
    #[serde(default)]
    pub member_refs: Vec<MemberRef>,
    /// User string heap
    #[serde(default)]
    pub user_strings: Vec<UserString>,
    /// Standalone signatures
    #[serde(default)]
    pub signatures: Vec<StandAloneSig>,
    /// Embedded resources
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Sizes of the reference tables at one point in time, see [`Container::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    type_refs: usize,
    member_refs: usize,
    user_strings: usize,
    signatures: usize,
}

fn next_row<'a>(tokens: impl Iterator<Item = &'a Token>) -> u32 {
    tokens.map(Token::row).max().unwrap_or(0) + 1
}

impl Container {
    /// Create an empty container holding only the global type.
    #[must_use]
    pub fn new(name: &str, image_kind: ImageKind) -> Self {
        Container {
            name: name.to_string(),
            image_kind,
            native_sections: Vec::new(),
            win32_resources: None,
            types: vec![TypeDef {
                token: Token::from_parts(TableId::TypeDef, 1),
                namespace: String::new(),
                name: GLOBAL_TYPE_NAME.to_string(),
                flags: TypeAttributes::empty(),
                extends: None,
                enclosing: None,
                fields: Vec::new(),
                methods: Vec::new(),
                nested_types: Vec::new(),
            }],
            fields: Vec::new(),
            methods: Vec::new(),
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            member_refs: Vec::new(),
            user_strings: Vec::new(),
            signatures: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Token of the global type.
    #[must_use]
    pub fn global_type_token(&self) -> Token {
        self.global_type()
            .map_or(Token::from_parts(TableId::TypeDef, 1), |t| t.token)
    }

    /// The module-level type.
    #[must_use]
    pub fn global_type(&self) -> Option<&TypeDef> {
        self.types
            .iter()
            .find(|t| t.name == GLOBAL_TYPE_NAME && t.enclosing.is_none())
    }

    /// Look up a type definition.
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.token == token)
    }

    fn type_def_mut(&mut self, token: Token) -> Option<&mut TypeDef> {
        self.types.iter_mut().find(|t| t.token == token)
    }

    /// Look up a field definition.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.token == token)
    }

    /// Look up a method definition.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.token == token)
    }

    /// Look up a method definition for modification.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        self.methods.iter_mut().find(|m| m.token == token)
    }

    /// Look up a member reference.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        self.member_refs.iter().find(|m| m.token == token)
    }

    /// Look up a type reference.
    #[must_use]
    pub fn type_ref(&self, token: Token) -> Option<&TypeRef> {
        self.type_refs.iter().find(|t| t.token == token)
    }

    /// Look up a user string.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<&str> {
        self.user_strings
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.value.as_str())
    }

    /// Name of the member a field, method or member reference token points to.
    #[must_use]
    pub fn member_name(&self, token: Token) -> Option<&str> {
        match TableId::from_byte(token.table()) {
            Some(TableId::Field) => self.field(token).map(|f| f.name.as_str()),
            Some(TableId::MethodDef) => self.method(token).map(|m| m.name.as_str()),
            Some(TableId::MemberRef) => self.member_ref(token).map(|m| m.name.as_str()),
            _ => None,
        }
    }

    /// Full name of a type definition or reference, nested types joined with `/`.
    #[must_use]
    pub fn type_full_name(&self, token: Token) -> String {
        if let Some(def) = self.type_def(token) {
            return match def.enclosing {
                Some(outer) => format!("{}/{}", self.type_full_name(outer), def.name),
                None if def.namespace.is_empty() => def.name.clone(),
                None => format!("{}.{}", def.namespace, def.name),
            };
        }
        if let Some(r) = self.type_ref(token) {
            return if r.namespace.is_empty() {
                r.name.clone()
            } else {
                format!("{}.{}", r.namespace, r.name)
            };
        }
        token.to_string()
    }

    /// Full name of a method in the `Namespace.Type::Name` form.
    #[must_use]
    pub fn method_full_name(&self, token: Token) -> String {
        match self.method(token) {
            Some(method) => format!(
                "{}::{}",
                self.type_full_name(method.declaring_type),
                method.name
            ),
            None => match self.member_ref(token) {
                Some(member) => format!("{}::{}", self.type_full_name(member.parent), member.name),
                None => token.to_string(),
            },
        }
    }

    /// Add a type definition. Nested types are linked into their enclosing type.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        enclosing: Option<Token>,
    ) -> Token {
        let token = Token::from_parts(
            TableId::TypeDef,
            next_row(self.types.iter().map(|t| &t.token)),
        );
        self.types.push(TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            extends: None,
            enclosing,
            fields: Vec::new(),
            methods: Vec::new(),
            nested_types: Vec::new(),
        });
        if let Some(outer) = enclosing.and_then(|t| self.type_def_mut(t)) {
            outer.nested_types.push(token);
        }
        token
    }

    /// Add a field to `owner`.
    pub fn add_field(
        &mut self,
        owner: Token,
        name: &str,
        flags: FieldAttributes,
        field_type: Option<Token>,
    ) -> Token {
        let token = Token::from_parts(TableId::Field, next_row(self.fields.iter().map(|f| &f.token)));
        self.fields.push(FieldDef {
            token,
            name: name.to_string(),
            flags,
            declaring_type: owner,
            field_type,
        });
        if let Some(owner) = self.type_def_mut(owner) {
            owner.fields.push(token);
        }
        token
    }

    /// Add a method to `owner`.
    pub fn add_method(
        &mut self,
        owner: Token,
        name: &str,
        flags: MethodAttributes,
        body: Option<MethodBody>,
    ) -> Token {
        let token = Token::from_parts(
            TableId::MethodDef,
            next_row(self.methods.iter().map(|m| &m.token)),
        );
        self.methods.push(MethodDef {
            token,
            name: name.to_string(),
            flags,
            declaring_type: owner,
            signature: Vec::new(),
            impl_map: None,
            body,
        });
        if let Some(owner) = self.type_def_mut(owner) {
            owner.methods.push(token);
        }
        token
    }

    /// Add an assembly reference.
    pub fn add_assembly_ref(&mut self, name: &str, version: &str) -> Token {
        let token = Token::from_parts(
            TableId::AssemblyRef,
            next_row(self.assembly_refs.iter().map(|a| &a.token)),
        );
        self.assembly_refs.push(AssemblyRef {
            token,
            name: name.to_string(),
            version: version.to_string(),
            culture: String::new(),
            public_key_token: String::new(),
        });
        token
    }

    /// Find or add a type reference.
    pub fn import_type_ref(&mut self, scope: Token, namespace: &str, name: &str) -> Token {
        if let Some(existing) = self
            .type_refs
            .iter()
            .find(|t| t.scope == scope && t.namespace == namespace && t.name == name)
        {
            return existing.token;
        }

        let token = Token::from_parts(
            TableId::TypeRef,
            next_row(self.type_refs.iter().map(|t| &t.token)),
        );
        self.type_refs.push(TypeRef {
            token,
            scope,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        token
    }

    /// Find or add a member reference.
    pub fn import_member_ref(&mut self, parent: Token, name: &str, signature: &[u8]) -> Token {
        if let Some(existing) = self
            .member_refs
            .iter()
            .find(|m| m.parent == parent && m.name == name && m.signature == signature)
        {
            return existing.token;
        }

        let token = Token::from_parts(
            TableId::MemberRef,
            next_row(self.member_refs.iter().map(|m| &m.token)),
        );
        self.member_refs.push(MemberRef {
            token,
            parent,
            name: name.to_string(),
            signature: signature.to_vec(),
        });
        token
    }

    /// Find or add a user string, returning its `ldstr` token.
    pub fn intern_user_string(&mut self, value: &str) -> Token {
        if let Some(existing) = self.user_strings.iter().find(|s| s.value == value) {
            return existing.token;
        }

        let token = Token::from_parts(
            TableId::UserString,
            next_row(self.user_strings.iter().map(|s| &s.token)),
        );
        self.user_strings.push(UserString {
            token,
            value: value.to_string(),
        });
        token
    }

    /// Find or add a standalone signature.
    pub fn intern_signature(&mut self, blob: &[u8]) -> Token {
        if let Some(existing) = self.signatures.iter().find(|s| s.blob == blob) {
            return existing.token;
        }

        let token = Token::from_parts(
            TableId::StandAloneSig,
            next_row(self.signatures.iter().map(|s| &s.token)),
        );
        self.signatures.push(StandAloneSig {
            token,
            blob: blob.to_vec(),
        });
        token
    }

    /// Record the size of the append-only reference tables.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            type_refs: self.type_refs.len(),
            member_refs: self.member_refs.len(),
            user_strings: self.user_strings.len(),
            signatures: self.signatures.len(),
        }
    }

    /// Drop reference table rows added since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.type_refs.truncate(checkpoint.type_refs);
        self.member_refs.truncate(checkpoint.member_refs);
        self.user_strings.truncate(checkpoint.user_strings);
        self.signatures.truncate(checkpoint.signatures);
    }

    /// Remove a field. Returns false if it did not exist.
    pub fn remove_field(&mut self, token: Token) -> bool {
        let Some(position) = self.fields.iter().position(|f| f.token == token) else {
            return false;
        };

        let field = self.fields.remove(position);
        if let Some(owner) = self.type_def_mut(field.declaring_type) {
            owner.fields.retain(|f| *f != token);
        }
        true
    }

    /// Remove a method. Returns false if it did not exist.
    pub fn remove_method(&mut self, token: Token) -> bool {
        let Some(position) = self.methods.iter().position(|m| m.token == token) else {
            return false;
        };

        let method = self.methods.remove(position);
        if let Some(owner) = self.type_def_mut(method.declaring_type) {
            owner.methods.retain(|m| *m != token);
        }
        true
    }

    /// Remove a type with all its members and nested types.
    ///
    /// A nested type is detached from its enclosing type's nested list. Returns false if the
    /// type did not exist.
    pub fn remove_type(&mut self, token: Token) -> bool {
        let Some(position) = self.types.iter().position(|t| t.token == token) else {
            return false;
        };

        let removed = self.types.remove(position);
        if let Some(outer) = removed.enclosing.and_then(|t| self.type_def_mut(t)) {
            outer.nested_types.retain(|n| *n != token);
        }
        self.fields.retain(|f| f.declaring_type != token);
        self.methods.retain(|m| m.declaring_type != token);
        for nested in removed.nested_types {
            self.remove_type(nested);
        }
        true
    }

    /// Remove every resource matching `predicate`, returning how many were removed.
    pub fn remove_resources(&mut self, predicate: impl Fn(&Resource) -> bool) -> usize {
        let before = self.resources.len();
        self.resources.retain(|r| !predicate(r));
        before - self.resources.len()
    }

    /// Methods whose body has `token` as an instruction operand.
    pub fn methods_referencing(&self, token: Token) -> impl Iterator<Item = Token> + '_ {
        self.methods
            .iter()
            .filter(move |m| {
                m.body.as_ref().is_some_and(|body| {
                    body.instructions
                        .iter()
                        .any(|insn| insn.operand.token() == Some(token))
                })
            })
            .map(|m| m.token)
    }

    /// Returns true if anything in the container refers to type `token`.
    ///
    /// References counted are base types, field types, declaring types of surviving members
    /// other than the type's own, and instruction or handler operands naming the type or one of
    /// its members.
    #[must_use]
    pub fn is_type_referenced(&self, token: Token) -> bool {
        let Some(def) = self.type_def(token) else {
            return false;
        };

        let own_members = |t: Token| {
            t == token
                || def.fields.contains(&t)
                || def.methods.contains(&t)
                || def.nested_types.contains(&t)
        };

        if self.types.iter().any(|t| t.token != token && t.extends == Some(token)) {
            return true;
        }
        if self
            .fields
            .iter()
            .filter(|f| f.declaring_type != token)
            .any(|f| f.field_type == Some(token))
        {
            return true;
        }
        if self.member_refs.iter().any(|m| m.parent == token) {
            return true;
        }

        self.methods
            .iter()
            .filter(|m| m.declaring_type != token)
            .filter_map(|m| m.body.as_ref())
            .any(|body| {
                body.instructions.iter().any(|insn| match insn.operand {
                    Operand::Token(t) => own_members(t),
                    _ => false,
                }) || body
                    .exception_handlers
                    .iter()
                    .any(|h| h.catch_type == Some(token))
            })
    }

    /// The static constructor of `owner`, if present.
    #[must_use]
    pub fn static_constructor(&self, owner: Token) -> Option<&MethodDef> {
        self.methods.iter().find(|m| {
            m.declaring_type == owner
                && m.name == ".cctor"
                && m.flags.contains(MethodAttributes::STATIC)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{opcodes, Instruction};

    fn sample() -> (Container, Token, Token, Token) {
        let mut container = Container::new("Sample.exe", ImageKind::IlOnly);
        let global = container.global_type_token();
        let program = container.add_type("Sample", "Program", TypeAttributes::PUBLIC, None);
        let nested = container.add_type("", "Helper", TypeAttributes::NESTED_PRIVATE, Some(program));
        (container, global, program, nested)
    }

    #[test]
    fn new_container_has_global_type() {
        let container = Container::new("a.dll", ImageKind::IlOnly);
        let global = container.global_type().unwrap();
        assert_eq!(global.name, "<Module>");
        assert_eq!(global.token, Token::new(0x02000001));
    }

    #[test]
    fn tokens_are_allocated_per_table() {
        let (mut container, global, program, nested) = sample();
        assert_eq!(program, Token::new(0x02000002));
        assert_eq!(nested, Token::new(0x02000003));
        assert_eq!(
            container.add_field(global, "a", FieldAttributes::STATIC, None),
            Token::new(0x04000001)
        );
        assert_eq!(
            container.add_method(program, "Main", MethodAttributes::STATIC, None),
            Token::new(0x06000001)
        );
        assert_eq!(
            container.type_def(program).unwrap().nested_types,
            vec![nested]
        );
    }

    #[test]
    fn names() {
        let (mut container, _, program, nested) = sample();
        let method = container.add_method(nested, "Run", MethodAttributes::PUBLIC, None);
        assert_eq!(container.type_full_name(program), "Sample.Program");
        assert_eq!(container.method_full_name(method), "Sample.Program/Helper::Run");
        assert_eq!(container.member_name(method), Some("Run"));
    }

    #[test]
    fn interning_deduplicates() {
        let mut container = Container::new("a.dll", ImageKind::IlOnly);
        let first = container.intern_user_string("hello");
        let second = container.intern_user_string("hello");
        let other = container.intern_user_string("world");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.is_table(TableId::UserString));
        assert_eq!(container.user_string(other), Some("world"));

        let scope = container.add_assembly_ref("mscorlib", "4.0.0.0");
        let object = container.import_type_ref(scope, "System", "Object");
        assert_eq!(container.import_type_ref(scope, "System", "Object"), object);
        let ctor = container.import_member_ref(object, ".ctor", &[0x20, 0x00, 0x01]);
        assert_eq!(container.import_member_ref(object, ".ctor", &[0x20, 0x00, 0x01]), ctor);
        assert_eq!(container.intern_signature(&[0x07, 0x01, 0x08]), container.intern_signature(&[0x07, 0x01, 0x08]));
    }

    #[test]
    fn rollback_drops_new_rows() {
        let mut container = Container::new("a.dll", ImageKind::IlOnly);
        let kept = container.intern_user_string("kept");
        let checkpoint = container.checkpoint();
        container.intern_user_string("dropped");
        let scope = container.add_assembly_ref("mscorlib", "4.0.0.0");
        container.import_type_ref(scope, "System", "Object");

        container.rollback(checkpoint);
        assert_eq!(container.user_strings.len(), 1);
        assert_eq!(container.user_string(kept), Some("kept"));
        assert!(container.type_refs.is_empty());
        assert_eq!(container.assembly_refs.len(), 1);
    }

    #[test]
    fn remove_members() {
        let (mut container, global, _, _) = sample();
        let field = container.add_field(global, "Invoke", FieldAttributes::STATIC, None);
        let method = container.add_method(global, "a", MethodAttributes::STATIC, None);

        assert!(container.remove_field(field));
        assert!(!container.remove_field(field));
        assert!(container.remove_method(method));
        assert!(!container.remove_method(method));
        let global = container.global_type().unwrap();
        assert!(global.fields.is_empty());
        assert!(global.methods.is_empty());
    }

    #[test]
    fn remove_type_detaches_nested() {
        let (mut container, _, program, nested) = sample();
        let inner = container.add_type("", "Inner", TypeAttributes::NESTED_PRIVATE, Some(nested));
        container.add_method(nested, "Run", MethodAttributes::PUBLIC, None);

        assert!(container.remove_type(nested));
        assert!(container.type_def(program).unwrap().nested_types.is_empty());
        assert!(container.type_def(inner).is_none());
        assert!(container.methods.is_empty());
        assert!(!container.remove_type(nested));
    }

    #[test]
    fn type_references() {
        let (mut container, global, program, nested) = sample();
        let field = container.add_field(global, "Invoke", FieldAttributes::STATIC, Some(nested));
        assert!(container.is_type_referenced(nested));

        container.remove_field(field);
        assert!(!container.is_type_referenced(nested));

        let invoke = container.add_method(nested, "Invoke", MethodAttributes::PUBLIC, None);
        container.add_method(
            program,
            "Main",
            MethodAttributes::STATIC,
            Some(MethodBody::new(vec![
                Instruction::with_token(opcodes::CALLVIRT, invoke),
                Instruction::simple(opcodes::RET),
            ])),
        );
        assert!(container.is_type_referenced(nested));
    }

    #[test]
    fn private_access_check() {
        assert!((MethodAttributes::PRIVATE | MethodAttributes::STATIC).is_private());
        assert!(!MethodAttributes::PUBLIC.is_private());
        assert!(!MethodAttributes::ASSEMBLY.is_private());
    }

    #[test]
    fn assembly_ref_full_name() {
        let mut container = Container::new("a.dll", ImageKind::IlOnly);
        container.add_assembly_ref("Newtonsoft.Json", "12.0.0.0");
        assert_eq!(
            container.assembly_refs[0].full_name(),
            "Newtonsoft.Json, Version=12.0.0.0, Culture=neutral, PublicKeyToken=null"
        );
    }
}
