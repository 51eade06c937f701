//! Loading a protected module both as a container and as a live artifact.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    emulation::{
        host::{ExecutionHost, LiveArtifact},
        intercept::Interceptor,
        native::{helper_candidates, NativeHelper, NativeLoader},
    },
    metadata::{Container, ContainerAccess, DependencyError},
    Error, Result,
};

/// Loads targets through a container access layer and an execution host.
pub struct ExecutionBridge<'a> {
    access: &'a dyn ContainerAccess,
    host: &'a dyn ExecutionHost,
    interceptor: Arc<Interceptor>,
}

impl<'a> ExecutionBridge<'a> {
    /// Create a bridge whose artifacts resolve methods through `interceptor`.
    #[must_use]
    pub fn new(
        access: &'a dyn ContainerAccess,
        host: &'a dyn ExecutionHost,
        interceptor: Arc<Interceptor>,
    ) -> Self {
        ExecutionBridge {
            access,
            host,
            interceptor,
        }
    }

    /// Load the module at `path`.
    ///
    /// Unresolved references are collected on the returned target and do not fail the load.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the file is absent, is not a valid container, or cannot be
    /// loaded for execution.
    pub fn load(&self, path: &Path) -> Result<LoadedTarget> {
        if !path.is_file() {
            return Err(Error::Load {
                path: path.to_path_buf(),
                message: "file not found".to_string(),
            });
        }

        let container = self.access.load(path)?;
        let unresolved = self.access.resolve_references(&container, path);
        for dependency in &unresolved {
            warn!("Unresolved reference {}", dependency.reference);
        }

        let artifact = self
            .host
            .load_artifact(path, &container)
            .map_err(|error| match error {
                Error::Load { .. } => error,
                other => Error::Load {
                    path: path.to_path_buf(),
                    message: other.to_string(),
                },
            })?;
        artifact.install_resolution_hook(Arc::clone(&self.interceptor))?;
        info!("Loaded {} ({} types)", container.name, container.types.len());

        Ok(LoadedTarget {
            path: path.to_path_buf(),
            container,
            artifact,
            unresolved,
            native_helper: None,
        })
    }
}

/// A module loaded for recovery.
pub struct LoadedTarget {
    /// Path the module was loaded from
    pub path: PathBuf,
    /// Static view, mutated by recovery and cleanup
    pub container: Container,
    /// Executable view
    pub artifact: Arc<dyn LiveArtifact>,
    /// References that could not be resolved
    pub unresolved: Vec<DependencyError>,
    native_helper: Option<NativeHelper>,
}

impl LoadedTarget {
    /// The unresolved references as [`Error::DependencyResolution`] values.
    #[must_use]
    pub fn unresolved_errors(&self) -> Vec<Error> {
        self.unresolved.iter().cloned().map(Error::from).collect()
    }

    /// Run the module initializer once. Later calls do nothing.
    ///
    /// # Errors
    /// Returns [`Error::Host`] if the initializer throws.
    pub fn activate(&self) -> Result<()> {
        if self.artifact.is_activated() {
            debug!("Module initializer already ran");
            return Ok(());
        }
        self.artifact.run_module_initializer()?;
        info!("Module initializer completed");
        Ok(())
    }

    /// Load the first usable native helper from the module's directory.
    ///
    /// Candidates are files named `prefix*suffix`; see [`helper_candidates`] for the order. The
    /// first one that loads and binds stays resident. Finding none is not an error.
    pub fn load_native_helpers(
        &mut self,
        loader: &dyn NativeLoader,
        prefix: &str,
        suffix: &str,
    ) -> Option<&NativeHelper> {
        if self.native_helper.is_none() {
            self.native_helper = self.first_native_helper(loader, prefix, suffix);
        }
        self.native_helper.as_ref()
    }

    fn first_native_helper(
        &self,
        loader: &dyn NativeLoader,
        prefix: &str,
        suffix: &str,
    ) -> Option<NativeHelper> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let candidates = match helper_candidates(directory, prefix, suffix) {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!("Cannot list native helpers in {}: {}", directory.display(), error);
                return None;
            }
        };

        for candidate in candidates {
            let helper = match loader.load(&candidate) {
                Ok(helper) => helper,
                Err(error) => {
                    debug!("Skipping {}: {}", candidate.display(), error);
                    continue;
                }
            };
            match self.artifact.bind_native_helper(&helper) {
                Ok(()) => {
                    info!("Bound native helper {}", helper.name);
                    return Some(helper);
                }
                Err(error) => debug!("{} rejected {}: {}", self.container.name, helper.name, error),
            }
        }

        warn!("No native helper could be loaded");
        None
    }

    /// The native helper bound by [`LoadedTarget::load_native_helpers`].
    #[must_use]
    pub fn native_helper(&self) -> Option<&NativeHelper> {
        self.native_helper.as_ref()
    }
}
