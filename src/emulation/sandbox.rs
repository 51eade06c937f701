//! A table-driven execution host.
//!
//! The sandbox does not run CIL. It stands in for the runtime with the behavior recovery relies
//! on, described by [`SandboxTables`] stored alongside the container in the image file:
//!
//! - the module initializer populates the lookup delegate fields;
//! - invoking a method lookup asks the resolution boundary who the caller is, which yields the
//!   `InvokeMethod` thunk unless an [`Interceptor`] redirects it, and returns the body registered
//!   for that caller and index;
//! - invoking a string lookup returns the registered literal.
//!
//! [`materialize`] produces the [`DynamicMethod`] a real runtime would hand back for a body, which
//! is how protected fixtures are built.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    assembly::{encode_stream, Operand},
    emulation::{
        host::{
            DynamicMethod, ExecutionHost, LiveArtifact, RuntimeField, RuntimeHandle,
            RuntimeMember, RuntimeMethod, RuntimeType, Value,
        },
        intercept::{Interceptor, MethodIdentity},
        native::NativeHelper,
    },
    image,
    metadata::{
        method::{encode_exception_section, ExceptionClause, ExceptionHandlerFlags, MethodBody},
        token::{TableId, Token},
        Container,
    },
    Error, Result,
};

/// Name and declaring type of the runtime frame that invokes lookups.
const INVOKE_THUNK: (&str, &str) = ("System.RuntimeMethodHandle", "InvokeMethod");

/// What a lookup delegate returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupKind {
    /// Method bodies, keyed by caller and index
    Method,
    /// String literals, keyed by index
    String,
}

/// A delegate stored in a static field by the module initializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegate {
    /// Field holding the delegate
    pub field: Token,
    /// The delegate type's `Invoke` method
    pub invoke: Token,
    /// Lookup behavior
    pub kind: LookupKind,
}

/// A method body served to one stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodEntry {
    /// The stub method asking for its body
    pub caller: Token,
    /// Trigger index the stub passes
    pub index: i32,
    /// The materialized body
    pub body: DynamicMethod,
}

/// Runtime behavior of a protected module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxTables {
    /// Delegates created by the module initializer
    #[serde(default)]
    pub delegates: Vec<Delegate>,
    /// Method bodies served by the method lookup
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
    /// Literals served by the string lookup
    #[serde(default)]
    pub strings: BTreeMap<i32, String>,
}

/// Host loading artifacts from the runtime tables of an image file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxHost;

impl ExecutionHost for SandboxHost {
    fn load_artifact(&self, path: &Path, container: &Container) -> Result<Arc<dyn LiveArtifact>> {
        let tables = image::read_image(path)?.runtime.unwrap_or_default();
        Ok(Arc::new(SandboxArtifact::new(container, tables)))
    }
}

/// A module running in the sandbox.
#[derive(Debug)]
pub struct SandboxArtifact {
    tables: SandboxTables,
    methods: HashMap<Token, String>,
    fields: HashMap<Token, String>,
    activated: AtomicBool,
    hook: RwLock<Option<Arc<Interceptor>>>,
    helper: RwLock<Option<String>>,
}

impl SandboxArtifact {
    /// Create an artifact for `container` behaving as described by `tables`.
    #[must_use]
    pub fn new(container: &Container, tables: SandboxTables) -> Self {
        SandboxArtifact {
            tables,
            methods: container
                .methods
                .iter()
                .map(|m| (m.token, m.name.clone()))
                .collect(),
            fields: container
                .fields
                .iter()
                .map(|f| (f.token, f.name.clone()))
                .collect(),
            activated: AtomicBool::new(false),
            hook: RwLock::new(None),
            helper: RwLock::new(None),
        }
    }

    /// Name of the native helper bound to the artifact.
    #[must_use]
    pub fn native_helper(&self) -> Option<String> {
        self.helper.read().ok().and_then(|h| h.clone())
    }

    fn ensure_activated(&self) -> Result<()> {
        if self.activated.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotActivated)
        }
    }

    fn calling_method(&self) -> Result<MethodIdentity> {
        let thunk = MethodIdentity::new(Token::default(), INVOKE_THUNK.0, INVOKE_THUNK.1);
        let hook = self.hook.read().map_err(|_| Error::LockError)?;
        Ok(match hook.as_ref() {
            Some(interceptor) => interceptor.resolve(thunk),
            None => thunk,
        })
    }

    fn lookup_method(&self, index: i32) -> Result<Value> {
        let caller = self.calling_method()?;
        debug!("Method lookup {index} from {caller}");
        self.tables
            .methods
            .iter()
            .find(|entry| entry.caller == caller.token && entry.index == index)
            .map(|entry| Value::Method(Box::new(entry.body.clone())))
            .ok_or_else(|| {
                Error::Host(format!(
                    "Invalid method index {index} for caller {}",
                    caller.token
                ))
            })
    }

    fn lookup_string(&self, index: i32) -> Result<Value> {
        self.tables
            .strings
            .get(&index)
            .map(|s| Value::String(s.clone()))
            .ok_or_else(|| Error::Host(format!("Invalid string index {index}")))
    }
}

impl LiveArtifact for SandboxArtifact {
    fn run_module_initializer(&self) -> Result<()> {
        self.activated.store(true, Ordering::Release);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    fn install_resolution_hook(&self, interceptor: Arc<Interceptor>) -> Result<()> {
        *self.hook.write().map_err(|_| Error::LockError)? = Some(interceptor);
        Ok(())
    }

    fn bind_native_helper(&self, helper: &NativeHelper) -> Result<()> {
        *self.helper.write().map_err(|_| Error::LockError)? = Some(helper.name.clone());
        Ok(())
    }

    fn resolve_method(&self, token: Token) -> Result<RuntimeMethod> {
        self.methods
            .get(&token)
            .map(|name| RuntimeMethod {
                token,
                name: name.clone(),
            })
            .ok_or_else(|| Error::Host(format!("Method {token} not found")))
    }

    fn resolve_field(&self, token: Token) -> Result<RuntimeField> {
        self.fields
            .get(&token)
            .map(|name| RuntimeField {
                token,
                name: name.clone(),
            })
            .ok_or_else(|| Error::Host(format!("Field {token} not found")))
    }

    fn field_value(&self, field: &RuntimeField) -> Result<Value> {
        self.ensure_activated()?;
        if self.tables.delegates.iter().any(|d| d.field == field.token) {
            Ok(Value::Object(field.token))
        } else {
            Ok(Value::Null)
        }
    }

    fn invoke(
        &self,
        method: &RuntimeMethod,
        instance: Option<&Value>,
        args: &[Value],
    ) -> Result<Value> {
        self.ensure_activated()?;

        let Some(Value::Object(target)) = instance else {
            return Err(Error::Host("Object reference not set to an instance".to_string()));
        };
        let delegate = self
            .tables
            .delegates
            .iter()
            .find(|d| d.field == *target && d.invoke == method.token)
            .ok_or_else(|| Error::Host(format!("{} is not invokable here", method.name)))?;
        let index = match args {
            [Value::I32(index)] => *index,
            _ => return Err(Error::Host("Parameter count mismatch".to_string())),
        };

        match delegate.kind {
            LookupKind::Method => self.lookup_method(index),
            LookupKind::String => self.lookup_string(index),
        }
    }
}

#[derive(Default)]
struct HandleTable {
    handles: Vec<RuntimeHandle>,
    assigned: HashMap<Token, Token>,
}

impl HandleTable {
    fn intern(&mut self, container: &Container, token: Token) -> Result<Token> {
        if let Some(dynamic) = self.assigned.get(&token) {
            return Ok(*dynamic);
        }

        let handle = describe(container, token)?;
        #[allow(clippy::cast_possible_truncation)]
        let dynamic = Token::new((u32::from(token.table()) << 24) | self.handles.len() as u32);
        self.handles.push(handle);
        self.assigned.insert(token, dynamic);
        Ok(dynamic)
    }
}

fn runtime_type(container: &Container, token: Token) -> Result<RuntimeType> {
    if let Some(def) = container.type_def(token) {
        return Ok(RuntimeType {
            assembly: container.name.clone(),
            token,
            namespace: def.namespace.clone(),
            name: def.name.clone(),
        });
    }

    let reference = container
        .type_ref(token)
        .ok_or_else(|| Error::Translation(format!("Type {token} not found")))?;
    let scope = container
        .assembly_refs
        .iter()
        .find(|a| a.token == reference.scope)
        .ok_or_else(|| {
            Error::Translation(format!("Type {token} is not scoped to an assembly"))
        })?;
    Ok(RuntimeType {
        assembly: scope.name.clone(),
        token: Token::default(),
        namespace: reference.namespace.clone(),
        name: reference.name.clone(),
    })
}

fn describe(container: &Container, token: Token) -> Result<RuntimeHandle> {
    match TableId::from_byte(token.table()) {
        Some(TableId::UserString) => container
            .user_string(token)
            .map(|s| RuntimeHandle::String(s.to_string()))
            .ok_or_else(|| Error::Translation(format!("String {token} not found"))),
        Some(TableId::TypeDef | TableId::TypeRef) => {
            Ok(RuntimeHandle::Type(runtime_type(container, token)?))
        }
        Some(TableId::MethodDef) => {
            let method = container
                .method(token)
                .ok_or_else(|| Error::Translation(format!("Method {token} not found")))?;
            Ok(RuntimeHandle::Method(RuntimeMember {
                declaring: runtime_type(container, method.declaring_type)?,
                token,
                name: method.name.clone(),
                signature: method.signature.clone(),
            }))
        }
        Some(TableId::Field) => {
            let field = container
                .field(token)
                .ok_or_else(|| Error::Translation(format!("Field {token} not found")))?;
            Ok(RuntimeHandle::Field(RuntimeMember {
                declaring: runtime_type(container, field.declaring_type)?,
                token,
                name: field.name.clone(),
                signature: Vec::new(),
            }))
        }
        Some(TableId::MemberRef) => {
            let member = container
                .member_ref(token)
                .ok_or_else(|| Error::Translation(format!("Member {token} not found")))?;
            let runtime = RuntimeMember {
                declaring: runtime_type(container, member.parent)?,
                token: Token::default(),
                name: member.name.clone(),
                signature: member.signature.clone(),
            };
            // FIELD calling convention
            if member.signature.first() == Some(&0x06) {
                Ok(RuntimeHandle::Field(runtime))
            } else {
                Ok(RuntimeHandle::Method(runtime))
            }
        }
        Some(TableId::StandAloneSig) => container
            .signatures
            .iter()
            .find(|s| s.token == token)
            .map(|s| RuntimeHandle::Signature(s.blob.clone()))
            .ok_or_else(|| Error::Translation(format!("Signature {token} not found"))),
        _ => Err(Error::Translation(format!(
            "Token {token} cannot be materialized"
        ))),
    }
}

/// Build the dynamic method a runtime would materialize for `body`.
///
/// Every token operand is replaced by a dynamic token into a fresh handle table, and exception
/// handlers are encoded as a fat exception section.
///
/// # Errors
/// Returns [`Error::Translation`] if an operand does not name a row of `container`, and encoder
/// errors for bodies that cannot be encoded.
pub fn materialize(container: &Container, name: &str, body: &MethodBody) -> Result<DynamicMethod> {
    let mut table = HandleTable::default();

    let mut instructions = body.instructions.clone();
    for insn in &mut instructions {
        if let Operand::Token(token) = insn.operand {
            insn.operand = Operand::Token(table.intern(container, token)?);
        }
    }
    let encoded = encode_stream(&instructions)?;
    let offset = |index: usize| {
        encoded
            .offset_of(index)
            .ok_or_else(|| malformed_error!("Handler bound {} is past the body", index))
    };

    let mut clauses = Vec::with_capacity(body.exception_handlers.len());
    for handler in &body.exception_handlers {
        let try_offset = offset(handler.try_start)?;
        let handler_offset = offset(handler.handler_start)?;
        let class_or_filter = if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
            offset(handler.filter_start.unwrap_or(handler.handler_start))?
        } else if let Some(catch) = handler.catch_type {
            table.intern(container, catch)?.value()
        } else {
            0
        };
        clauses.push(ExceptionClause {
            flags: handler.flags,
            try_offset,
            try_length: offset(handler.try_end)? - try_offset,
            handler_offset,
            handler_length: offset(handler.handler_end)? - handler_offset,
            class_or_filter,
        });
    }

    let locals = match body.local_var_sig {
        Some(token) => Some(
            container
                .signatures
                .iter()
                .find(|s| s.token == token)
                .map(|s| s.blob.clone())
                .ok_or_else(|| Error::Translation(format!("Locals {token} not found")))?,
        ),
        None => None,
    };

    Ok(DynamicMethod {
        name: name.to_string(),
        il: encoded.code,
        max_stack: body.max_stack,
        init_locals: body.init_locals,
        locals,
        exceptions: encode_exception_section(&clauses),
        tokens: table.handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Instruction},
        metadata::{FieldAttributes, ImageKind, MethodAttributes, TypeAttributes},
    };

    struct Fixture {
        container: Container,
        stub: Token,
        tables: SandboxTables,
        invoke: Token,
        field: Token,
    }

    fn fixture() -> Fixture {
        let mut container = Container::new("Sample.exe", ImageKind::IlOnly);
        let global = container.global_type_token();
        let delegate = container.add_type("", "a", TypeAttributes::empty(), None);
        let invoke = container.add_method(delegate, "Invoke", MethodAttributes::PUBLIC, None);
        let field = container.add_field(global, "Invoke", FieldAttributes::STATIC, Some(delegate));
        let strings = container.add_field(global, "String", FieldAttributes::STATIC, Some(delegate));
        let stub = container.add_method(global, "Run", MethodAttributes::STATIC, None);

        let literal = container.intern_user_string("hi");
        let body = materialize(
            &container,
            "Run",
            &MethodBody::new(vec![Instruction::ldstr(literal), Instruction::simple(opcodes::RET)]),
        )
        .unwrap();

        let tables = SandboxTables {
            delegates: vec![
                Delegate {
                    field,
                    invoke,
                    kind: LookupKind::Method,
                },
                Delegate {
                    field: strings,
                    invoke,
                    kind: LookupKind::String,
                },
            ],
            methods: vec![MethodEntry {
                caller: stub,
                index: 3,
                body,
            }],
            strings: BTreeMap::from([(7, "secret".to_string())]),
        };
        Fixture {
            container,
            stub,
            tables,
            invoke,
            field,
        }
    }

    fn call(artifact: &SandboxArtifact, invoke: Token, field: Token, index: i32) -> Result<Value> {
        let method = artifact.resolve_method(invoke)?;
        artifact.invoke(&method, Some(&Value::Object(field)), &[Value::I32(index)])
    }

    #[test]
    fn lookups_need_activation() {
        let f = fixture();
        let artifact = SandboxArtifact::new(&f.container, f.tables);
        assert!(matches!(
            call(&artifact, f.invoke, f.field, 3),
            Err(Error::NotActivated)
        ));
        let field = artifact.resolve_field(f.field).unwrap();
        assert!(matches!(artifact.field_value(&field), Err(Error::NotActivated)));
    }

    #[test]
    fn method_lookup_needs_redirection() {
        let f = fixture();
        let artifact = SandboxArtifact::new(&f.container, f.tables);
        artifact.run_module_initializer().unwrap();

        // Without a hook the caller is the runtime thunk
        assert!(matches!(
            call(&artifact, f.invoke, f.field, 3),
            Err(Error::Host(_))
        ));

        let interceptor = Arc::new(Interceptor::default());
        artifact
            .install_resolution_hook(Arc::clone(&interceptor))
            .unwrap();
        let identity = MethodIdentity::new(f.stub, "<Module>", "Run");
        let guard = interceptor
            .arm(identity, std::thread::current().id())
            .unwrap();
        let value = call(&artifact, f.invoke, f.field, 3).unwrap();
        drop(guard);

        let Value::Method(body) = value else {
            panic!("expected a method, got {value:?}");
        };
        assert_eq!(body.tokens, vec![RuntimeHandle::String("hi".to_string())]);
    }

    #[test]
    fn string_lookup() {
        let f = fixture();
        let strings = f.container.fields[1].token;
        let artifact = SandboxArtifact::new(&f.container, f.tables);
        artifact.run_module_initializer().unwrap();

        assert_eq!(
            call(&artifact, f.invoke, strings, 7).unwrap(),
            Value::String("secret".to_string())
        );
        assert!(call(&artifact, f.invoke, strings, 8).is_err());
    }

    #[test]
    fn field_values() {
        let f = fixture();
        let artifact = SandboxArtifact::new(&f.container, f.tables);
        artifact.run_module_initializer().unwrap();
        let field = artifact.resolve_field(f.field).unwrap();
        assert_eq!(artifact.field_value(&field).unwrap(), Value::Object(f.field));
        assert!(artifact.resolve_field(Token::new(0x0400_0099)).is_err());
    }

    #[test]
    fn materialize_encodes_handlers() {
        let f = fixture();
        let mut body = MethodBody::new(vec![
            Instruction::nop(),
            Instruction::new(opcodes::LEAVE_S, Operand::Target(4)),
            Instruction::nop(),
            Instruction::simple(opcodes::ENDFINALLY),
            Instruction::simple(opcodes::RET),
        ]);
        body.exception_handlers
            .push(crate::metadata::method::ExceptionHandler {
                flags: ExceptionHandlerFlags::FINALLY,
                try_start: 0,
                try_end: 2,
                handler_start: 2,
                handler_end: 4,
                filter_start: None,
                catch_type: None,
            });

        let dynamic = materialize(&f.container, "m", &body).unwrap();
        let clauses = crate::metadata::method::parse_exception_sections(&dynamic.exceptions).unwrap();
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].try_offset, 0);
        assert_eq!(clauses[0].try_length, 3);
        assert_eq!(clauses[0].handler_offset, 3);
        assert_eq!(clauses[0].handler_length, 2);
    }

    #[test]
    fn materialize_rejects_unknown_tokens() {
        let f = fixture();
        let body = MethodBody::new(vec![
            Instruction::with_token(opcodes::CALL, Token::new(0x0600_0077)),
            Instruction::simple(opcodes::RET),
        ]);
        assert!(matches!(
            materialize(&f.container, "m", &body),
            Err(Error::Translation(_))
        ));
    }
}
