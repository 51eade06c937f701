use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    assembly::{Instruction, Operand},
    metadata::{method::ExceptionHandler, token::Token},
    Error, Result,
};

/// An editable method body.
///
/// Branch operands and exception handler bounds are instruction indices, so the body can be
/// rewritten instruction by instruction and re-encoded by the container writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether locals are zero-initialized
    #[serde(default)]
    pub init_locals: bool,
    /// `StandAloneSig` token describing the locals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_var_sig: Option<Token>,
    /// The instruction stream
    pub instructions: Vec<Instruction>,
    /// Exception handling clauses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a body from instructions, with a stack depth of 8 and no locals.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        MethodBody {
            max_stack: 8,
            init_locals: false,
            local_var_sig: None,
            instructions,
            exception_handlers: Vec::new(),
        }
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true if the body has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Indices of instructions outside `range` that branch into it.
    #[must_use]
    pub fn branches_into(&self, range: &Range<usize>) -> Vec<usize> {
        self.instructions
            .iter()
            .enumerate()
            .filter(|(index, _)| !range.contains(index))
            .filter(|(_, insn)| insn.operand.targets().iter().any(|t| range.contains(t)))
            .map(|(index, _)| index)
            .collect()
    }

    /// Remove the instructions in `range` and shift every branch target and handler bound
    /// that follows it.
    ///
    /// Handlers lying entirely inside the range are dropped. An exclusive end bound equal to
    /// `range.start` stays where it is.
    ///
    /// # Errors
    /// Returns [`Error::CctorLayout`] and leaves the body untouched if an instruction outside the
    /// range branches into it, or a remaining handler starts inside it or ends strictly inside
    /// it.
    pub fn remove_range(&mut self, range: Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.instructions.len() {
            return Err(Error::CctorLayout(format!(
                "range {}..{} exceeds body of {} instructions",
                range.start,
                range.end,
                self.instructions.len()
            )));
        }

        let sources = self.branches_into(&range);
        if let Some(source) = sources.first() {
            return Err(Error::CctorLayout(format!(
                "instruction {source} branches into the removed range"
            )));
        }

        let removed = range.end - range.start;
        let inside = |h: &ExceptionHandler| {
            h.try_start < range.end
                && h
                    .bounds()
                    .iter()
                    .all(|b| *b >= range.start && *b <= range.end)
        };

        let mut handlers = Vec::with_capacity(self.exception_handlers.len());
        for handler in &self.exception_handlers {
            if inside(handler) {
                continue;
            }

            let starts = [
                Some(handler.try_start),
                Some(handler.handler_start),
                handler.filter_start,
            ];
            if starts.iter().flatten().any(|s| range.contains(s)) {
                return Err(Error::CctorLayout(
                    "exception handler starts inside the removed range".to_string(),
                ));
            }
            if [handler.try_end, handler.handler_end]
                .iter()
                .any(|e| *e > range.start && *e < range.end)
            {
                return Err(Error::CctorLayout(
                    "exception handler ends inside the removed range".to_string(),
                ));
            }

            let shift = |index: usize| {
                if index >= range.end {
                    index - removed
                } else {
                    index
                }
            };
            handlers.push(ExceptionHandler {
                flags: handler.flags,
                try_start: shift(handler.try_start),
                try_end: shift(handler.try_end),
                handler_start: shift(handler.handler_start),
                handler_end: shift(handler.handler_end),
                filter_start: handler.filter_start.map(shift),
                catch_type: handler.catch_type,
            });
        }

        self.instructions.drain(range.clone());
        for insn in &mut self.instructions {
            match &mut insn.operand {
                Operand::Target(target) if *target >= range.end => *target -= removed,
                Operand::Switch(targets) => {
                    for target in targets.iter_mut().filter(|t| **t >= range.end) {
                        *target -= removed;
                    }
                }
                _ => {}
            }
        }
        self.exception_handlers = handlers;
        Ok(())
    }
}
