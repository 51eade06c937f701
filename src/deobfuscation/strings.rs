//! Recovery of encrypted string literals.

use std::{fmt, sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    assembly::Instruction,
    deobfuscation::patterns::{find_string_sites, LookupEntry, StringSite},
    emulation::{invoke_bounded, LiveArtifact, RuntimeMethod, Value},
    metadata::{token::Token, Container},
    Error, Result,
};

/// A string lookup that could not be resolved. The site is left as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringFailure {
    /// Full name of the containing method
    pub method: String,
    /// Token of the containing method
    pub token: Token,
    /// Instruction index of the lookup
    pub index: usize,
    /// Why the lookup failed
    pub message: String,
}

impl fmt::Display for StringFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "string lookup at {}+{} ({}): {}",
            self.method, self.index, self.token, self.message
        )
    }
}

/// Result of one string recovery pass.
#[derive(Debug, Default)]
pub struct StringRecovery {
    /// Lookup sites found
    pub sites: usize,
    /// Sites rewritten to `ldstr`
    pub recovered: usize,
    /// Sites left in place
    pub failures: Vec<StringFailure>,
}

/// Replaces string lookups with the literals they return.
pub struct StringRecoverer<'a> {
    artifact: &'a Arc<dyn LiveArtifact>,
    lookup: RuntimeMethod,
    instance: Value,
    field: Token,
    lookup_name: String,
    timeout: Option<Duration>,
}

impl<'a> StringRecoverer<'a> {
    /// Prepare recovery through the lookup described by `entry`.
    ///
    /// # Errors
    /// Returns an error if the artifact cannot resolve the lookup or read its delegate.
    pub fn new(
        artifact: &'a Arc<dyn LiveArtifact>,
        entry: &LookupEntry,
        lookup_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let lookup = artifact.resolve_method(entry.invoke)?;
        let instance = artifact.field_value(&artifact.resolve_field(entry.field)?)?;
        Ok(StringRecoverer {
            artifact,
            lookup,
            instance,
            field: entry.field,
            lookup_name: lookup_name.to_string(),
            timeout,
        })
    }

    /// Rewrite every lookup triple in `container` to `ldstr`, `nop`, `nop`.
    pub fn run(&self, container: &mut Container) -> StringRecovery {
        let view: &Container = container;
        let sites: Vec<StringSite> = view
            .methods
            .iter()
            .flat_map(|method| find_string_sites(view, method, self.field, &self.lookup_name))
            .collect();

        let mut outcome = StringRecovery {
            sites: sites.len(),
            ..StringRecovery::default()
        };
        for site in sites {
            match self.recover(container, &site) {
                Ok(()) => outcome.recovered += 1,
                Err(error) => {
                    let failure = StringFailure {
                        method: container.method_full_name(site.method),
                        token: site.method,
                        index: site.index,
                        message: error.to_string(),
                    };
                    warn!("Failed {failure}");
                    outcome.failures.push(failure);
                }
            }
        }

        info!(
            "Recovered {} of {} strings",
            outcome.recovered, outcome.sites
        );
        outcome
    }

    fn recover(&self, container: &mut Container, site: &StringSite) -> Result<()> {
        let value = invoke_bounded(
            self.artifact,
            &self.lookup,
            Some(self.instance.clone()),
            vec![Value::I32(site.trigger)],
            self.timeout,
            |_| Ok(()),
        )?;
        let literal = match value {
            Value::String(literal) => literal,
            other => {
                return Err(Error::Host(format!(
                    "String lookup returned {} instead of a string",
                    other.kind()
                )))
            }
        };

        let token = container.intern_user_string(&literal);
        let insns = container
            .method_mut(site.method)
            .and_then(|m| m.body.as_mut())
            .map(|b| &mut b.instructions)
            .filter(|insns| site.index + 2 < insns.len())
            .ok_or_else(|| Error::Error(format!("String site in {} vanished", site.method)))?;

        debug!("{}+{}: {:?}", site.method, site.index, literal);
        insns[site.index] = Instruction::ldstr(token);
        insns[site.index + 1] = Instruction::nop();
        insns[site.index + 2] = Instruction::nop();
        Ok(())
    }
}
