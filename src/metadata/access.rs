use std::path::Path;

use strum::Display;

use crate::{
    metadata::{container::ImageKind, Container},
    Result,
};

/// How a container is written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WriteMode {
    /// Metadata and IL only
    #[strum(to_string = "metadata")]
    Metadata,
    /// Native image, keeping native sections and Win32 resources
    #[strum(to_string = "native")]
    Native,
}

impl WriteMode {
    /// The mode that preserves everything an image of `kind` carries.
    #[must_use]
    pub fn for_image(kind: ImageKind) -> Self {
        match kind {
            ImageKind::IlOnly => WriteMode::Metadata,
            ImageKind::Native => WriteMode::Native,
        }
    }
}

/// A reference that could not be resolved while loading a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyError {
    /// Full display name of the missing reference
    pub reference: String,
}

impl From<DependencyError> for crate::Error {
    fn from(error: DependencyError) -> Self {
        crate::Error::DependencyResolution {
            reference: error.reference,
        }
    }
}

/// Reads and writes containers.
///
/// Implementations own the on-disk format; the rest of the crate only sees [`Container`].
pub trait ContainerAccess {
    /// Load the container stored at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Load`] if the file is missing or not a valid container.
    fn load(&self, path: &Path) -> Result<Container>;

    /// Try to resolve every assembly the container references, returning the ones that failed.
    fn resolve_references(&self, container: &Container, path: &Path) -> Vec<DependencyError>;

    /// Write `container` to `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Serialization`] if the container cannot be written.
    fn save(&self, container: &Container, path: &Path, mode: WriteMode) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_follows_image_kind() {
        assert_eq!(WriteMode::for_image(ImageKind::IlOnly), WriteMode::Metadata);
        assert_eq!(WriteMode::for_image(ImageKind::Native), WriteMode::Native);
        assert_eq!(WriteMode::Native.to_string(), "native");
    }

    #[test]
    fn dependency_error_converts() {
        let error: crate::Error = DependencyError {
            reference: "Foo, Version=1.0.0.0".to_string(),
        }
        .into();
        assert!(matches!(error, crate::Error::DependencyResolution { .. }));
    }
}
