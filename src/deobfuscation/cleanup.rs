//! Removal of the protection apparatus after recovery.
//!
//! Cleanup runs in a fixed order:
//!
//! 1. Excise the protection fragment from the global static constructor. A constructor left
//!    with a single instruction joins the junk set.
//! 2. Remove P/Invoke stubs bound to the native helpers.
//! 3. Drain the junk set: fields (with their backing types), methods, nested types.
//! 4. Remove embedded native helper resources.
//!
//! Every step only removes what is still there, so a second run removes nothing.

use std::{collections::HashSet, fmt, ops::Range};

use log::{debug, info, warn};

use crate::{
    assembly::{opcodes, Instruction},
    deobfuscation::{
        config::{CleanupConfig, UnpackConfig},
        junk::{JunkEntry, JunkSet},
    },
    metadata::{method::MethodBody, token::TableId, token::Token, Container},
    Error, Result,
};

/// Counts of what cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Protection fields removed
    pub fields_removed: usize,
    /// Methods removed, P/Invoke stubs excluded
    pub methods_removed: usize,
    /// Types removed, nested helpers and backing types alike
    pub types_removed: usize,
    /// P/Invoke stubs bound to native helpers removed
    pub native_stubs_removed: usize,
    /// Embedded helper resources removed
    pub resources_removed: usize,
    /// Instructions excised from the static constructor
    pub cctor_instructions_removed: usize,
    /// Problems that left something in place
    pub warnings: Vec<String>,
}

impl CleanupStats {
    /// Total number of removed entities and instructions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.fields_removed
            + self.methods_removed
            + self.types_removed
            + self.native_stubs_removed
            + self.resources_removed
            + self.cctor_instructions_removed
    }

    /// Returns true if nothing was removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fields, {} methods, {} types, {} native stubs, {} resources, {} cctor instructions",
            self.fields_removed,
            self.methods_removed,
            self.types_removed,
            self.native_stubs_removed,
            self.resources_removed,
            self.cctor_instructions_removed
        )
    }
}

/// What happened to the static constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CctorOutcome {
    /// No constructor, or no protection fragment in it
    Untouched,
    /// The fragment was removed
    Excised {
        /// Instructions removed
        removed: usize,
        /// Whether a single instruction is left
        emptied: bool,
    },
}

fn calls(insn: &Instruction, container: &Container, name: &str) -> bool {
    insn.opcode == opcodes::CALL
        && insn
            .operand
            .token()
            .and_then(|t| container.member_name(t))
            .is_some_and(|n| n == name)
}

/// Locate and validate the protection fragment in `body`.
///
/// Returns `Ok(None)` if the body does not call `start`.
///
/// # Errors
/// Returns [`Error::CctorLayout`] if the fragment is present but does not have the expected
/// shape.
pub fn find_cctor_window(
    container: &Container,
    body: &MethodBody,
    start: &str,
    end: &str,
) -> Result<Option<Range<usize>>> {
    let insns = &body.instructions;
    let Some(open) = insns.iter().position(|i| calls(i, container, start)) else {
        return Ok(None);
    };
    let close = insns
        .iter()
        .position(|i| calls(i, container, end))
        .ok_or_else(|| Error::CctorLayout(format!("no call to {end} follows {start}")))?;
    if close <= open {
        return Err(Error::CctorLayout(format!(
            "call to {end} at {close} precedes {start} at {open}"
        )));
    }

    let first = open
        .checked_sub(2)
        .ok_or_else(|| Error::CctorLayout(format!("{start} is called at {open}, too early")))?;
    let last = close + 2;
    if last + 1 >= insns.len() {
        return Err(Error::CctorLayout(format!(
            "window ending at {last} leaves no instruction of {}",
            insns.len()
        )));
    }
    if insns[last].opcode != opcodes::ENDFINALLY {
        return Err(Error::CctorLayout(format!(
            "window ends with {} instead of endfinally",
            insns[last].mnemonic()
        )));
    }

    let window = first..last + 1;
    if let Some(source) = body.branches_into(&window).first() {
        return Err(Error::CctorLayout(format!(
            "instruction {source} branches into the window"
        )));
    }
    for handler in &body.exception_handlers {
        let bounds = handler.bounds();
        let low = bounds.iter().copied().min().unwrap_or(0);
        let high = bounds.iter().copied().max().unwrap_or(0);
        let touches = low < window.end && high > window.start;
        let inside = low >= window.start && high <= window.end;
        if touches && !inside && handler.handler_end != window.end {
            return Err(Error::CctorLayout(format!(
                "exception handler {}..{} straddles the window",
                handler.try_start, handler.handler_end
            )));
        }
    }

    Ok(Some(window))
}

/// Remove the protection fragment from the static constructor of `owner`.
///
/// The body is changed only if every check passes.
///
/// # Errors
/// Returns [`Error::CctorLayout`] if the fragment does not have the expected shape.
pub fn excise_cctor_window(
    container: &mut Container,
    owner: Token,
    start: &str,
    end: &str,
) -> Result<CctorOutcome> {
    let Some(cctor) = container.static_constructor(owner) else {
        return Ok(CctorOutcome::Untouched);
    };
    let Some(body) = cctor.body.as_ref() else {
        return Ok(CctorOutcome::Untouched);
    };
    let token = cctor.token;
    let Some(window) = find_cctor_window(container, body, start, end)? else {
        return Ok(CctorOutcome::Untouched);
    };

    let mut body = body.clone();
    body.exception_handlers
        .retain(|handler| handler.handler_end != window.end);
    let removed = window.len();
    body.remove_range(window)?;
    let emptied = body.len() == 1;

    if let Some(cctor) = container.method_mut(token) {
        cctor.body = Some(body);
    }
    debug!("Excised {removed} instructions from {token}");
    Ok(CctorOutcome::Excised { removed, emptied })
}

/// Remove every method bound by P/Invoke to one of the native helpers.
pub fn remove_native_stubs(container: &mut Container, config: &UnpackConfig) -> usize {
    let stubs: Vec<Token> = container
        .methods
        .iter()
        .filter(|m| {
            m.impl_map
                .as_ref()
                .is_some_and(|map| config.is_native_helper(&map.module))
        })
        .map(|m| m.token)
        .collect();

    stubs
        .into_iter()
        .filter(|token| container.remove_method(*token))
        .count()
}

/// Remove every embedded resource named like a native helper.
pub fn remove_helper_resources(container: &mut Container, config: &UnpackConfig) -> usize {
    container.remove_resources(|resource| config.is_helper_name(&resource.name))
}

/// The type a junk method marks for removal with `marker`, if any.
fn marked_type(container: &Container, method: Token, marker: &str) -> Option<Token> {
    let insns = &container.method(method)?.body.as_ref()?.instructions;
    let first = insns.first()?;
    if first.opcode != opcodes::LDSTR {
        return None;
    }
    let literal = container.user_string(first.operand.token()?)?;
    if !literal.contains(marker) {
        return None;
    }
    insns
        .get(1)?
        .operand
        .token()
        .filter(|t| t.is_table(TableId::TypeDef) && container.type_def(*t).is_some())
}

/// Drain `junk` and remove each entry from `container`.
///
/// A field still used by a method that survives the drain stays in place and is reported as a
/// warning.
pub fn remove_junk(container: &mut Container, junk: &mut JunkSet, marker: &str) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let entries = junk.drain();
    let doomed = doomed_methods(container, &entries);

    for entry in entries {
        match entry {
            JunkEntry::Field(token) => {
                if let Some(user) = container
                    .methods_referencing(token)
                    .find(|method| !doomed.contains(method))
                {
                    let warning = format!(
                        "Kept field {} used by {}",
                        container.member_name(token).unwrap_or_default(),
                        container.method_full_name(user)
                    );
                    warn!("{warning}");
                    stats.warnings.push(warning);
                    continue;
                }

                let backing = container.field(token).and_then(|f| f.field_type);
                if container.remove_field(token) {
                    stats.fields_removed += 1;
                }
                if let Some(ty) = backing {
                    if container.type_def(ty).is_some()
                        && !container.is_type_referenced(ty)
                        && container.remove_type(ty)
                    {
                        stats.types_removed += 1;
                    }
                }
            }
            JunkEntry::Method(token) => {
                if let Some(ty) = marked_type(container, token, marker) {
                    if container.remove_type(ty) {
                        stats.types_removed += 1;
                    }
                }
                if container.remove_method(token) {
                    stats.methods_removed += 1;
                }
            }
            JunkEntry::Type(token) => {
                if container.remove_type(token) {
                    stats.types_removed += 1;
                }
            }
        }
    }

    stats
}

/// Methods the drain removes, directly or with their declaring type.
fn doomed_methods(container: &Container, entries: &[JunkEntry]) -> HashSet<Token> {
    let mut doomed = HashSet::new();
    for entry in entries {
        match entry {
            JunkEntry::Method(token) => {
                doomed.insert(*token);
            }
            JunkEntry::Type(token) => {
                if let Some(def) = container.type_def(*token) {
                    doomed.extend(def.methods.iter().copied());
                }
            }
            JunkEntry::Field(_) => {}
        }
    }
    doomed
}

/// Run every enabled cleanup step.
pub fn cleanup(container: &mut Container, junk: &mut JunkSet, config: &UnpackConfig) -> CleanupStats {
    let toggles: &CleanupConfig = &config.cleanup;
    let mut stats = CleanupStats::default();

    if toggles.clean_static_constructor {
        let global = container.global_type_token();
        match excise_cctor_window(
            container,
            global,
            &config.cctor_window_start,
            &config.cctor_window_end,
        ) {
            Ok(CctorOutcome::Excised { removed, emptied }) => {
                stats.cctor_instructions_removed = removed;
                if emptied {
                    if let Some(cctor) = container.static_constructor(global) {
                        junk.add_method(cctor.token);
                    }
                }
            }
            Ok(CctorOutcome::Untouched) => debug!("Static constructor has no protection fragment"),
            Err(error) => {
                warn!("Static constructor left unchanged: {error}");
                stats.warnings.push(error.to_string());
            }
        }
    }

    if toggles.remove_native_stubs {
        stats.native_stubs_removed = remove_native_stubs(container, config);
    }

    if toggles.remove_junk {
        let removed = remove_junk(container, junk, &config.junk_marker);
        stats.fields_removed = removed.fields_removed;
        stats.methods_removed = removed.methods_removed;
        stats.types_removed = removed.types_removed;
        stats.warnings.extend(removed.warnings);
    }

    if toggles.remove_helper_resources {
        stats.resources_removed = remove_helper_resources(container, config);
    }

    info!("Cleanup removed {stats}");
    stats
}
