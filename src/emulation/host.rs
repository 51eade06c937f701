//! The boundary between the unpacker and the environment that executes the protected module.
//!
//! The unpacker never interprets protection code itself. It loads the module into an
//! [`ExecutionHost`], triggers its initializer and calls its own lookup routines through a
//! [`LiveArtifact`]. What comes back is either a [`Value::String`] for string lookups or a
//! [`Value::Method`] carrying a [`DynamicMethod`], the runtime-materialized form of a method body.

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    emulation::{intercept::Interceptor, native::NativeHelper},
    metadata::{token::Token, Container},
    Result,
};

/// A type as the runtime identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeType {
    /// Simple name of the assembly defining the type
    pub assembly: String,
    /// Token of the type inside its defining module, null when unknown
    #[serde(default)]
    pub token: Token,
    /// Namespace
    #[serde(default)]
    pub namespace: String,
    /// Type name
    pub name: String,
}

/// A method or field as the runtime identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMember {
    /// Declaring type
    pub declaring: RuntimeType,
    /// Token of the member inside its defining module, null when unknown
    #[serde(default)]
    pub token: Token,
    /// Member name
    pub name: String,
    /// Signature blob
    #[serde(default)]
    pub signature: Vec<u8>,
}

/// What a dynamic token of a [`DynamicMethod`] resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeHandle {
    /// A string literal
    String(String),
    /// A type handle
    Type(RuntimeType),
    /// A method handle
    Method(RuntimeMember),
    /// A field handle
    Field(RuntimeMember),
    /// A standalone signature, for `calli` or locals
    Signature(Vec<u8>),
    /// Another dynamic method, which has no static counterpart
    DynamicMethod(String),
}

/// A method body materialized at runtime.
///
/// Operands that name metadata carry dynamic tokens: the high byte is the table kind, the low
/// 24 bits index [`DynamicMethod::tokens`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicMethod {
    /// Name the runtime gave the method
    pub name: String,
    /// Raw IL
    pub il: Vec<u8>,
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether locals are zero-initialized
    #[serde(default)]
    pub init_locals: bool,
    /// Locals signature blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locals: Option<Vec<u8>>,
    /// Exception handling sections, byte-offset form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<u8>,
    /// Token table
    #[serde(default)]
    pub tokens: Vec<RuntimeHandle>,
}

impl DynamicMethod {
    /// Resolve a dynamic token against the token table.
    #[must_use]
    pub fn handle(&self, token: Token) -> Option<&RuntimeHandle> {
        self.tokens.get(token.row() as usize)
    }
}

/// A value crossing the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null reference
    Null,
    /// 32-bit integer
    I32(i32),
    /// String
    String(String),
    /// Opaque object, identified by the field that holds it
    Object(Token),
    /// A materialized method
    Method(Box<DynamicMethod>),
}

impl Value {
    /// Type name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I32(_) => "int32",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Method(_) => "method",
        }
    }
}

/// A method resolved to something the host can invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMethod {
    /// Container token the method was resolved from
    pub token: Token,
    /// Method name
    pub name: String,
}

/// A field resolved to something the host can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeField {
    /// Container token the field was resolved from
    pub token: Token,
    /// Field name
    pub name: String,
}

/// The protected module, loaded for execution.
pub trait LiveArtifact: Send + Sync {
    /// Run the module initializer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Host`] if the initializer throws.
    fn run_module_initializer(&self) -> Result<()>;

    /// Returns true once the module initializer has run.
    fn is_activated(&self) -> bool;

    /// Route the runtime's method-resolution boundary through `interceptor`.
    ///
    /// # Errors
    /// Returns an error if the hook cannot be installed.
    fn install_resolution_hook(&self, interceptor: Arc<Interceptor>) -> Result<()>;

    /// Make a loaded native helper available to the module.
    ///
    /// # Errors
    /// Returns an error if the module rejects the helper.
    fn bind_native_helper(&self, _helper: &NativeHelper) -> Result<()> {
        Ok(())
    }

    /// Resolve a container method token to an invokable handle.
    ///
    /// # Errors
    /// Returns [`crate::Error::Host`] if the token does not name a method of the module.
    fn resolve_method(&self, token: Token) -> Result<RuntimeMethod>;

    /// Resolve a container field token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Host`] if the token does not name a field of the module.
    fn resolve_field(&self, token: Token) -> Result<RuntimeField>;

    /// Read a static field.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotActivated`] before the module initializer ran.
    fn field_value(&self, field: &RuntimeField) -> Result<Value>;

    /// Invoke `method` on `instance` with `args`.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotActivated`] before the module initializer ran, and
    /// [`crate::Error::Host`] if the method throws.
    fn invoke(&self, method: &RuntimeMethod, instance: Option<&Value>, args: &[Value])
        -> Result<Value>;
}

/// Loads a module for execution.
pub trait ExecutionHost {
    /// Load the module stored at `path`, whose static form is `container`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Load`] if the module cannot be loaded for execution.
    fn load_artifact(&self, path: &Path, container: &Container) -> Result<Arc<dyn LiveArtifact>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::TableId;

    #[test]
    fn dynamic_token_indexes_table() {
        let method = DynamicMethod {
            name: "a".to_string(),
            il: vec![0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: vec![
                RuntimeHandle::String("first".to_string()),
                RuntimeHandle::String("second".to_string()),
            ],
        };
        assert_eq!(
            method.handle(Token::from_parts(TableId::UserString, 1)),
            Some(&RuntimeHandle::String("second".to_string()))
        );
        assert!(method.handle(Token::from_parts(TableId::UserString, 2)).is_none());
    }

    #[test]
    fn value_kinds() {
        assert_eq!(Value::I32(3).kind(), "int32");
        assert_eq!(Value::Null.kind(), "null");
    }
}
