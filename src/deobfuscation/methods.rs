//! Recovery of virtualized method bodies.
//!
//! Each stub asks the method lookup for its real body. The lookup identifies its caller through
//! the runtime, so the stub's identity is armed in the [`Interceptor`] for exactly the duration
//! of the call. The returned dynamic method is translated and replaces the stub; nothing is
//! written unless both steps succeed.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    deobfuscation::{
        junk::JunkSet,
        patterns::{find_stubs, LookupEntry, StubSite},
        translate::translate,
    },
    emulation::{invoke_bounded, Interceptor, LiveArtifact, MethodIdentity, RuntimeMethod, Value},
    metadata::{token::Token, Container},
    Error, Result,
};

/// Result of one method recovery pass.
#[derive(Debug, Default)]
pub struct MethodRecovery {
    /// Stubs found
    pub stubs: usize,
    /// Methods whose body was replaced
    pub recovered: Vec<Token>,
    /// One [`Error::StubRecovery`] per stub left in place
    pub failures: Vec<Error>,
}

/// Recovers stub bodies through a live artifact.
pub struct MethodRecoverer<'a> {
    artifact: &'a Arc<dyn LiveArtifact>,
    interceptor: &'a Interceptor,
    lookup: RuntimeMethod,
    instance: Value,
    field: Token,
    helper_offset: usize,
    timeout: Option<Duration>,
}

impl<'a> MethodRecoverer<'a> {
    /// Prepare recovery through the lookup described by `entry`.
    ///
    /// # Errors
    /// Returns an error if the artifact cannot resolve the lookup or read its delegate, which
    /// includes [`Error::NotActivated`] before the module initializer ran.
    pub fn new(
        artifact: &'a Arc<dyn LiveArtifact>,
        interceptor: &'a Interceptor,
        entry: &LookupEntry,
        helper_offset: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let lookup = artifact.resolve_method(entry.invoke)?;
        let instance = artifact.field_value(&artifact.resolve_field(entry.field)?)?;
        Ok(MethodRecoverer {
            artifact,
            interceptor,
            lookup,
            instance,
            field: entry.field,
            helper_offset,
            timeout,
        })
    }

    /// Recover every stub in `container`.
    ///
    /// Helper types named by stubs are added to `junk` whether or not recovery succeeds.
    pub fn run(&self, container: &mut Container, junk: &mut JunkSet) -> MethodRecovery {
        let sites = find_stubs(container, self.field, self.helper_offset);
        info!("Found {} virtualized methods", sites.len());

        let mut outcome = MethodRecovery {
            stubs: sites.len(),
            ..MethodRecovery::default()
        };
        for site in sites {
            if let Some(helper) = site.helper_type {
                junk.add_type(helper);
            }

            match self.recover(container, &site) {
                Ok(()) => outcome.recovered.push(site.method),
                Err(source) => {
                    let method = container.method_full_name(site.method);
                    warn!("Failed to recover {} ({}): {}", method, site.method, source);
                    outcome.failures.push(Error::StubRecovery {
                        method,
                        token: site.method,
                        source: Box::new(source),
                    });
                }
            }
        }

        info!(
            "Recovered {} of {} methods",
            outcome.recovered.len(),
            outcome.stubs
        );
        outcome
    }

    fn recover(&self, container: &mut Container, site: &StubSite) -> Result<()> {
        let identity = {
            let method = container
                .method(site.method)
                .ok_or_else(|| Error::Error(format!("Method {} vanished", site.method)))?;
            MethodIdentity::new(
                method.token,
                container.type_full_name(method.declaring_type),
                method.name.clone(),
            )
        };
        debug!("Looking up body {} for {}", site.trigger, identity);

        let value = invoke_bounded(
            self.artifact,
            &self.lookup,
            Some(self.instance.clone()),
            vec![Value::I32(site.trigger)],
            self.timeout,
            |owner| self.interceptor.arm(identity, owner),
        )?;
        let dynamic = match value {
            Value::Method(dynamic) => dynamic,
            other => {
                return Err(Error::Host(format!(
                    "Method lookup returned {} instead of a method",
                    other.kind()
                )))
            }
        };

        let body = translate(container, &dynamic)?;
        let method = container
            .method_mut(site.method)
            .ok_or_else(|| Error::Error(format!("Method {} vanished", site.method)))?;
        debug!(
            "Replaced {} with {} instructions",
            site.method,
            body.instructions.len()
        );
        method.body = Some(body);
        Ok(())
    }
}
