//! The on-disk image format.
//!
//! An image file is a JSON document holding a [`Container`] and, for protected modules, the
//! [`SandboxTables`] the sandbox host executes. [`ImageAccess`] implements [`ContainerAccess`]
//! on top of it:
//!
//! - references to framework assemblies are always considered present;
//! - any other reference resolves if `<name>.dll` or `<name>.exe` sits next to the module;
//! - saving in [`WriteMode::Metadata`] drops native sections and Win32 resources, and never
//!   writes runtime tables.
//!
//! # Examples
//!
//! ```rust,no_run
//! use ilunpack::{image::ImageAccess, metadata::ContainerAccess};
//! use std::path::Path;
//!
//! let access = ImageAccess::default();
//! let path = Path::new("Sample.exe");
//! let container = access.load(path)?;
//! for missing in access.resolve_references(&container, path) {
//!     println!("missing {}", missing.reference);
//! }
//! # Ok::<(), ilunpack::Error>(())
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    emulation::SandboxTables,
    metadata::{Container, ContainerAccess, DependencyError, WriteMode},
    Error, Result,
};

/// Assembly name prefixes that resolve without a file on disk.
pub const DEFAULT_FRAMEWORK_PREFIXES: &[&str] = &["mscorlib", "System", "Microsoft", "netstandard"];

/// Contents of an image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFile {
    /// The module
    pub container: Container,
    /// Runtime behavior, present only for modules that still carry the protection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<SandboxTables>,
}

/// Read the image file at `path`.
///
/// # Errors
/// Returns [`Error::Load`] if the file cannot be read or parsed.
pub fn read_image(path: &Path) -> Result<ImageFile> {
    fs::read(path)
        .map_err(Error::from)
        .and_then(|data| decode_image(&data))
        .map_err(|error| Error::Load {
            path: path.to_path_buf(),
            message: error.to_string(),
        })
}

/// Write `image` to `path`.
///
/// # Errors
/// Returns [`Error::Serialization`] if the image cannot be encoded or written.
pub fn write_image(path: &Path, image: &ImageFile) -> Result<()> {
    encode_image(image)
        .and_then(|data| Ok(fs::write(path, data)?))
        .map_err(|error| Error::Serialization {
            path: path.to_path_buf(),
            message: error.to_string(),
        })
}

fn decode_image(data: &[u8]) -> Result<ImageFile> {
    Ok(serde_json::from_slice(data)?)
}

fn encode_image(image: &ImageFile) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(image)?)
}

/// [`ContainerAccess`] over JSON image files.
#[derive(Debug, Clone)]
pub struct ImageAccess {
    framework_prefixes: Vec<String>,
}

impl Default for ImageAccess {
    fn default() -> Self {
        ImageAccess::new(DEFAULT_FRAMEWORK_PREFIXES.iter().map(ToString::to_string))
    }
}

impl ImageAccess {
    /// Create an access layer treating assemblies named by `framework_prefixes` as present.
    ///
    /// A name matches a prefix if it equals it or continues it with a `.`.
    pub fn new<I, S>(framework_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ImageAccess {
            framework_prefixes: framework_prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `name` is a framework assembly.
    #[must_use]
    pub fn is_framework(&self, name: &str) -> bool {
        self.framework_prefixes.iter().any(|prefix| {
            name == prefix
                || name
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn candidates(directory: &Path, name: &str) -> [PathBuf; 2] {
        [
            directory.join(format!("{name}.dll")),
            directory.join(format!("{name}.exe")),
        ]
    }
}

impl ContainerAccess for ImageAccess {
    fn load(&self, path: &Path) -> Result<Container> {
        let image = read_image(path)?;
        debug!(
            "Read {} ({} methods, runtime tables: {})",
            path.display(),
            image.container.methods.len(),
            image.runtime.is_some()
        );
        Ok(image.container)
    }

    fn resolve_references(&self, container: &Container, path: &Path) -> Vec<DependencyError> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        container
            .assembly_refs
            .iter()
            .filter(|reference| !self.is_framework(&reference.name))
            .filter(|reference| {
                !Self::candidates(directory, &reference.name)
                    .iter()
                    .any(|candidate| candidate.is_file())
            })
            .map(|reference| DependencyError {
                reference: reference.full_name(),
            })
            .collect()
    }

    fn save(&self, container: &Container, path: &Path, mode: WriteMode) -> Result<()> {
        let container = match mode {
            WriteMode::Native => container.clone(),
            WriteMode::Metadata => Container {
                native_sections: Vec::new(),
                win32_resources: None,
                ..container.clone()
            },
        };
        write_image(
            path,
            &ImageFile {
                container,
                runtime: None,
            },
        )
    }
}
