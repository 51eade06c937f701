//! Translating materialized method bodies back into container form.
//!
//! A [`DynamicMethod`] carries raw IL whose metadata operands are dynamic tokens into its own
//! handle table, plus exception clauses in byte-offset form. Translation decodes the IL into
//! index-based instructions and maps every dynamic token to a container token:
//!
//! | Handle | Container token |
//! |--------|-----------------|
//! | string | interned user string |
//! | type, method, field of the module | the member's own token, after checking it exists |
//! | type of a referenced assembly | `TypeRef`, found or added |
//! | method or field of a referenced assembly | `MemberRef`, found or added |
//! | signature | `StandAloneSig`, found or added |
//!
//! Mapping is find-or-add, so translating a body that was materialized from the container yields
//! exactly the tokens it started with. Translation is all or nothing: rows added for a body that
//! then fails to translate are rolled back.

use std::collections::HashMap;

use crate::{
    assembly::{decode_stream, Operand},
    emulation::{DynamicMethod, RuntimeHandle, RuntimeMember, RuntimeType},
    metadata::{
        method::{parse_exception_sections, ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        token::{TableId, Token},
        Container,
    },
    Error, Result,
};

/// Translate `method` into a body of `container`.
///
/// # Errors
/// Returns [`Error::Translation`] if a dynamic token has no container counterpart, and
/// [`Error::Malformed`] if the IL or its exception clauses cannot be decoded. On error the
/// container is left as it was.
pub fn translate(container: &mut Container, method: &DynamicMethod) -> Result<MethodBody> {
    let checkpoint = container.checkpoint();
    let result = translate_body(container, method);
    if result.is_err() {
        container.rollback(checkpoint);
    }
    result
}

fn translate_body(container: &mut Container, method: &DynamicMethod) -> Result<MethodBody> {
    let decoded = decode_stream(&method.il)?;
    let mut mapped: HashMap<Token, Token> = HashMap::new();
    let mut map = |container: &mut Container, dynamic: Token| -> Result<Token> {
        if let Some(token) = mapped.get(&dynamic) {
            return Ok(*token);
        }
        let token = map_token(container, method, dynamic)?;
        mapped.insert(dynamic, token);
        Ok(token)
    };

    let mut instructions = decoded.instructions.clone();
    for insn in &mut instructions {
        if let Operand::Token(dynamic) = insn.operand {
            insn.operand = Operand::Token(map(container, dynamic)?);
        }
    }

    let index = |offset: u32| {
        decoded.index_of(offset).ok_or_else(|| {
            malformed_error!("Exception clause offset {:#x} is not an instruction boundary", offset)
        })
    };
    let end = |offset: u32, length: u32| {
        offset
            .checked_add(length)
            .ok_or_else(|| malformed_error!("Exception clause range overflows"))
            .and_then(index)
    };

    let mut exception_handlers = Vec::new();
    for clause in parse_exception_sections(&method.exceptions)? {
        let filter_start = if clause.flags.contains(ExceptionHandlerFlags::FILTER) {
            Some(index(clause.class_or_filter)?)
        } else {
            None
        };
        let catch_type = if clause.flags.is_empty() {
            Some(map(container, Token::new(clause.class_or_filter))?)
        } else {
            None
        };

        exception_handlers.push(ExceptionHandler {
            flags: clause.flags,
            try_start: index(clause.try_offset)?,
            try_end: end(clause.try_offset, clause.try_length)?,
            handler_start: index(clause.handler_offset)?,
            handler_end: end(clause.handler_offset, clause.handler_length)?,
            filter_start,
            catch_type,
        });
    }

    let local_var_sig = method
        .locals
        .as_ref()
        .map(|blob| container.intern_signature(blob));

    Ok(MethodBody {
        max_stack: method.max_stack,
        init_locals: method.init_locals,
        local_var_sig,
        instructions,
        exception_handlers,
    })
}

fn map_token(container: &mut Container, method: &DynamicMethod, dynamic: Token) -> Result<Token> {
    let handle = method.handle(dynamic).ok_or_else(|| {
        Error::Translation(format!(
            "Dynamic token {dynamic} is outside the token table of {}",
            method.name
        ))
    })?;
    if !handle_fits(handle, TableId::from_byte(dynamic.table())) {
        return Err(Error::Translation(format!(
            "Dynamic token {dynamic} of {} has the wrong table for its handle",
            method.name
        )));
    }

    match handle {
        RuntimeHandle::String(value) => Ok(container.intern_user_string(value)),
        RuntimeHandle::Type(ty) => import_type(container, ty),
        RuntimeHandle::Method(member) => import_member(container, member, TableId::MethodDef),
        RuntimeHandle::Field(member) => import_member(container, member, TableId::Field),
        RuntimeHandle::Signature(blob) => Ok(container.intern_signature(blob)),
        RuntimeHandle::DynamicMethod(name) => Err(Error::Translation(format!(
            "Reference to dynamic method {name} has no static form"
        ))),
    }
}

/// Returns true if a dynamic token of `table` may name `handle`.
fn handle_fits(handle: &RuntimeHandle, table: Option<TableId>) -> bool {
    matches!(
        (handle, table),
        (RuntimeHandle::String(_), Some(TableId::UserString))
            | (
                RuntimeHandle::Type(_),
                Some(TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec)
            )
            | (
                RuntimeHandle::Method(_) | RuntimeHandle::DynamicMethod(_),
                Some(TableId::MethodDef | TableId::MemberRef | TableId::MethodSpec)
            )
            | (
                RuntimeHandle::Field(_),
                Some(TableId::Field | TableId::MemberRef)
            )
            | (RuntimeHandle::Signature(_), Some(TableId::StandAloneSig))
    )
}

fn is_local(container: &Container, ty: &RuntimeType) -> bool {
    ty.assembly == container.name
}

fn import_type(container: &mut Container, ty: &RuntimeType) -> Result<Token> {
    if is_local(container, ty) {
        return match container.type_def(ty.token) {
            Some(def) if def.name == ty.name && def.namespace == ty.namespace => Ok(ty.token),
            _ => Err(Error::Translation(format!(
                "Type {}.{} ({}) is not defined in {}",
                ty.namespace, ty.name, ty.token, container.name
            ))),
        };
    }

    let scope = container
        .assembly_refs
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(&ty.assembly))
        .map(|a| a.token)
        .ok_or_else(|| {
            Error::Translation(format!(
                "Type {}.{} comes from {}, which is not referenced",
                ty.namespace, ty.name, ty.assembly
            ))
        })?;
    Ok(container.import_type_ref(scope, &ty.namespace, &ty.name))
}

fn import_member(container: &mut Container, member: &RuntimeMember, table: TableId) -> Result<Token> {
    if is_local(container, &member.declaring) && !member.token.is_null() {
        if member.token.is_table(table) && container.member_name(member.token) == Some(&member.name)
        {
            return Ok(member.token);
        }
        return Err(Error::Translation(format!(
            "Member {} ({}) is not defined in {}",
            member.name, member.token, container.name
        )));
    }

    let parent = import_type(container, &member.declaring)?;
    Ok(container.import_member_ref(parent, &member.name, &member.signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Instruction},
        emulation::materialize,
        metadata::{FieldAttributes, ImageKind, MethodAttributes, TypeAttributes},
    };

    fn container() -> Container {
        let mut container = Container::new("Sample.exe", ImageKind::IlOnly);
        let mscorlib = container.add_assembly_ref("mscorlib", "4.0.0.0");
        let exception = container.import_type_ref(mscorlib, "System", "Exception");
        let console = container.import_type_ref(mscorlib, "System", "Console");
        container.import_member_ref(console, "WriteLine", &[0x00, 0x01, 0x01, 0x0E]);
        container.import_member_ref(exception, "get_Message", &[0x20, 0x00, 0x0E]);
        let program = container.add_type("Sample", "Program", TypeAttributes::PUBLIC, None);
        container.add_field(program, "count", FieldAttributes::STATIC, None);
        container.add_method(program, "Helper", MethodAttributes::STATIC, None);
        container.intern_user_string("hello");
        container.intern_signature(&[0x07, 0x02, 0x08, 0x0E]);
        container
    }

    /// try { count = 1; Helper(); switch; } catch (Exception e) { WriteLine(e.Message) } ret
    fn body(container: &Container) -> MethodBody {
        let field = container.fields[0].token;
        let helper = container.methods[0].token;
        let write_line = container.member_refs[0].token;
        let message = container.member_refs[1].token;
        let exception = container.type_refs[0].token;
        let hello = container.user_strings[0].token;

        MethodBody {
            max_stack: 3,
            init_locals: true,
            local_var_sig: Some(container.signatures[0].token),
            instructions: vec![
                Instruction::ldc_i4(1),
                Instruction::with_token(opcodes::STSFLD, field),
                Instruction::with_token(opcodes::CALL, helper),
                Instruction::ldc_i4(0),
                Instruction::new(opcodes::SWITCH, Operand::Switch(vec![5, 7])),
                Instruction::with_token(opcodes::LDSTR, hello),
                Instruction::with_token(opcodes::CALL, write_line),
                Instruction::new(opcodes::LEAVE_S, Operand::Target(11)),
                Instruction::with_token(opcodes::CALLVIRT, message),
                Instruction::with_token(opcodes::CALL, write_line),
                Instruction::new(opcodes::LEAVE_S, Operand::Target(11)),
                Instruction::simple(opcodes::RET),
            ],
            exception_handlers: vec![ExceptionHandler {
                flags: ExceptionHandlerFlags::EXCEPTION,
                try_start: 0,
                try_end: 8,
                handler_start: 8,
                handler_end: 11,
                filter_start: None,
                catch_type: Some(exception),
            }],
        }
    }

    #[test]
    fn materialized_body_translates_back() {
        let mut container = container();
        let original = body(&container);
        let dynamic = materialize(&container, "Run", &original).unwrap();
        let before = container.clone();

        let recovered = translate(&mut container, &dynamic).unwrap();
        assert_eq!(recovered, original);
        assert_eq!(container, before);
    }

    #[test]
    fn external_members_are_imported() {
        let mut source = container();
        let mscorlib = source.assembly_refs[0].token;
        let math = source.import_type_ref(mscorlib, "System", "Math");
        let abs = source.import_member_ref(math, "Abs", &[0x00, 0x01, 0x08, 0x08]);
        let body = MethodBody::new(vec![
            Instruction::ldc_i4(-2),
            Instruction::with_token(opcodes::CALL, abs),
            Instruction::simple(opcodes::RET),
        ]);
        let dynamic = materialize(&source, "Run", &body).unwrap();

        let mut target = container();
        let recovered = translate(&mut target, &dynamic).unwrap();
        let call = recovered.instructions[1].operand.token().unwrap();
        assert_eq!(target.method_full_name(call), "System.Math::Abs");
        assert_eq!(target.type_refs.len(), 3);
    }

    #[test]
    fn unreferenced_assembly_fails_and_rolls_back() {
        let mut container = container();
        let dynamic = DynamicMethod {
            name: "Run".to_string(),
            il: vec![0x72, 0x00, 0x00, 0x00, 0x70, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: vec![
                RuntimeHandle::String("fresh".to_string()),
                RuntimeHandle::Method(RuntimeMember {
                    declaring: RuntimeType {
                        assembly: "Newtonsoft.Json".to_string(),
                        token: Token::default(),
                        namespace: "Newtonsoft.Json".to_string(),
                        name: "JsonConvert".to_string(),
                    },
                    token: Token::default(),
                    name: "SerializeObject".to_string(),
                    signature: vec![0x00, 0x01, 0x0E, 0x1C],
                }),
            ],
        };
        let before = container.clone();

        assert!(matches!(
            translate(&mut container, &dynamic),
            Err(Error::Translation(_))
        ));
        assert_eq!(container, before);
    }

    #[test]
    fn dynamic_method_reference_is_untranslatable() {
        let mut container = container();
        let dynamic = DynamicMethod {
            name: "Run".to_string(),
            il: vec![0x28, 0x00, 0x00, 0x00, 0x06, 0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: vec![RuntimeHandle::DynamicMethod("lambda".to_string())],
        };
        assert!(matches!(
            translate(&mut container, &dynamic),
            Err(Error::Translation(_))
        ));
    }

    #[test]
    fn token_outside_table_fails() {
        let mut container = container();
        let dynamic = DynamicMethod {
            name: "Run".to_string(),
            il: vec![0x72, 0x05, 0x00, 0x00, 0x70, 0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: Vec::new(),
        };
        assert!(translate(&mut container, &dynamic).is_err());
    }

    #[test]
    fn mismatched_local_member_fails() {
        let mut container = container();
        let program = container.types[1].token;
        let dynamic = DynamicMethod {
            name: "Run".to_string(),
            il: vec![0x28, 0x00, 0x00, 0x00, 0x06, 0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: vec![RuntimeHandle::Method(RuntimeMember {
                declaring: RuntimeType {
                    assembly: "Sample.exe".to_string(),
                    token: program,
                    namespace: "Sample".to_string(),
                    name: "Program".to_string(),
                },
                token: Token::new(0x0600_0001),
                name: "Renamed".to_string(),
                signature: Vec::new(),
            })],
        };
        assert!(matches!(
            translate(&mut container, &dynamic),
            Err(Error::Translation(_))
        ));
    }

    #[test]
    fn token_of_wrong_table_fails() {
        let mut container = container();
        // call 0x06000000 pointing at a string handle
        let dynamic = DynamicMethod {
            name: "Run".to_string(),
            il: vec![0x28, 0x00, 0x00, 0x00, 0x06, 0x2A],
            max_stack: 8,
            init_locals: false,
            locals: None,
            exceptions: Vec::new(),
            tokens: vec![RuntimeHandle::String("hello".to_string())],
        };
        let before = container.clone();

        assert!(matches!(
            translate(&mut container, &dynamic),
            Err(Error::Translation(_))
        ));
        assert_eq!(container, before);
    }
}
