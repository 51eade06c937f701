//! Recognizing the protection's entry points and call-site shapes.
//!
//! The protection adds two static fields to the global type, each holding a delegate whose
//! `Invoke` method is a lookup routine. A virtualized method keeps only a stub that loads the
//! method-lookup delegate, pushes its trigger index and calls it:
//!
//! ```text
//! ldsfld   <Module>::Invoke
//! ldc.i4   trigger
//! ...
//! ldtoken  <nested helper type>      // at the helper offset
//! ...
//! ```
//!
//! Encrypted string literals become a three-instruction lookup:
//!
//! ```text
//! ldsfld   <Module>::String
//! ldc.i4   index
//! callvirt Invoke
//! ```

use crate::{
    assembly::{opcodes, Instruction},
    metadata::{
        token::{TableId, Token},
        Container, MethodDef,
    },
};

/// A lookup delegate field and the routine that services it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupEntry {
    /// Global field holding the delegate
    pub field: Token,
    /// Delegate type, a `TypeDef` of the container
    pub delegate_type: Token,
    /// The delegate type's lookup method
    pub invoke: Token,
}

/// Find the global field `field_name` and the method `method_name` on its type.
///
/// Returns `None` if the field is missing, its type is not defined in the container, or the type
/// has no such method.
#[must_use]
pub fn find_lookup_entry(
    container: &Container,
    field_name: &str,
    method_name: &str,
) -> Option<LookupEntry> {
    let global = container.global_type()?;
    let field = global
        .fields
        .iter()
        .filter_map(|token| container.field(*token))
        .find(|field| field.name == field_name)?;
    let delegate_type = container.type_def(field.field_type?)?;
    let invoke = delegate_type
        .methods
        .iter()
        .filter_map(|token| container.method(*token))
        .find(|method| method.name == method_name)?;

    Some(LookupEntry {
        field: field.token,
        delegate_type: delegate_type.token,
        invoke: invoke.token,
    })
}

/// A virtualization stub found by [`match_stub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubSite {
    /// The stub method
    pub method: Token,
    /// Index passed to the method lookup
    pub trigger: i32,
    /// Nested helper type named at the helper offset, if it is one of the declaring type's
    pub helper_type: Option<Token>,
}

fn loads_field(insn: Option<&Instruction>, field: Token) -> bool {
    insn.is_some_and(|i| i.opcode == opcodes::LDSFLD && i.operand.token() == Some(field))
}

fn trigger_of(insn: Option<&Instruction>) -> Option<i32> {
    insn.and_then(Instruction::ldc_i4_value)
        .filter(|value| *value >= 0)
}

/// Check whether `method` is a virtualization stub for the lookup field `field`.
#[must_use]
pub fn match_stub(
    container: &Container,
    method: &MethodDef,
    field: Token,
    helper_offset: usize,
) -> Option<StubSite> {
    let body = method.body.as_ref()?;
    let insns = &body.instructions;
    if insns.len() <= 2 || !loads_field(insns.first(), field) {
        return None;
    }
    let trigger = trigger_of(insns.get(1))?;

    let helper_type = insns
        .get(helper_offset)
        .and_then(|insn| insn.operand.token())
        .filter(|token| token.is_table(TableId::TypeDef))
        .filter(|token| {
            container
                .type_def(method.declaring_type)
                .is_some_and(|owner| owner.nested_types.contains(token))
        });

    Some(StubSite {
        method: method.token,
        trigger,
        helper_type,
    })
}

/// Every stub in the container, in method table order.
#[must_use]
pub fn find_stubs(container: &Container, field: Token, helper_offset: usize) -> Vec<StubSite> {
    container
        .methods
        .iter()
        .filter_map(|method| match_stub(container, method, field, helper_offset))
        .collect()
}

/// A string lookup triple found by [`find_string_sites`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringSite {
    /// Method containing the triple
    pub method: Token,
    /// Index of the `ldsfld`
    pub index: usize,
    /// String index passed to the lookup
    pub trigger: i32,
}

/// Returns the string index if the triple starting at `index` is a string lookup.
#[must_use]
pub fn match_string_triple(
    container: &Container,
    insns: &[Instruction],
    index: usize,
    field: Token,
    lookup_name: &str,
) -> Option<i32> {
    if !loads_field(insns.get(index), field) {
        return None;
    }
    let trigger = trigger_of(insns.get(index + 1))?;
    let call = insns.get(index + 2)?;
    if call.opcode != opcodes::CALLVIRT {
        return None;
    }
    let callee = call.operand.token()?;
    (container.member_name(callee)? == lookup_name).then_some(trigger)
}

/// Every string lookup triple in `method`.
#[must_use]
pub fn find_string_sites(
    container: &Container,
    method: &MethodDef,
    field: Token,
    lookup_name: &str,
) -> Vec<StringSite> {
    let Some(body) = method.body.as_ref() else {
        return Vec::new();
    };

    let mut sites = Vec::new();
    let mut index = 0;
    while index < body.instructions.len() {
        match match_string_triple(container, &body.instructions, index, field, lookup_name) {
            Some(trigger) => {
                sites.push(StringSite {
                    method: method.token,
                    index,
                    trigger,
                });
                index += 3;
            }
            None => index += 1,
        }
    }
    sites
}
