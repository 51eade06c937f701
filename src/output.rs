//! Naming and writing the unpacked module.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    metadata::{Container, ContainerAccess, WriteMode},
    Error, Result,
};

/// The sibling of `input` named `<stem><suffix>.<ext>`.
///
/// ```rust
/// use ilunpack::output::output_path;
/// use std::path::{Path, PathBuf};
///
/// assert_eq!(
///     output_path(Path::new("dir/Sample.exe"), "-unpacked"),
///     PathBuf::from("dir/Sample-unpacked.exe")
/// );
/// ```
#[must_use]
pub fn output_path(input: &Path, suffix: &str) -> PathBuf {
    input.with_file_name(suffixed_filename(input, suffix))
}

fn suffixed_filename(input: &Path, suffix: &str) -> String {
    let stem = input
        .file_stem()
        .map_or("output".into(), |s| s.to_string_lossy());
    match input.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    }
}

/// Write `container` next to `input` under the suffixed name, returning the path written.
///
/// The container is saved to a temporary sibling first and renamed into place, so a failed write
/// leaves no partial output.
///
/// # Errors
/// Returns [`Error::Serialization`] if the output would overwrite `input`, or if saving or
/// renaming fails.
pub fn write_container(
    access: &dyn ContainerAccess,
    container: &Container,
    input: &Path,
    suffix: &str,
    mode: WriteMode,
) -> Result<PathBuf> {
    let output = output_path(input, suffix);
    if output == input {
        return Err(Error::Serialization {
            path: output,
            message: "output would overwrite the input".to_string(),
        });
    }

    let staging = output.with_file_name(format!(
        ".{}.partial",
        suffixed_filename(input, suffix)
    ));
    if let Err(error) = access.save(container, &staging, mode) {
        let _ = fs::remove_file(&staging);
        return Err(error);
    }
    if let Err(error) = fs::rename(&staging, &output) {
        let _ = fs::remove_file(&staging);
        return Err(Error::Serialization {
            path: output,
            message: error.to_string(),
        });
    }

    info!("Wrote {} ({} mode)", output.display(), mode);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::ImageAccess, metadata::ImageKind};

    #[test]
    fn suffixed_paths() {
        assert_eq!(
            output_path(Path::new("/tmp/app.dll"), "-unpacked"),
            PathBuf::from("/tmp/app-unpacked.dll")
        );
        assert_eq!(
            output_path(Path::new("app"), "-unpacked"),
            PathBuf::from("app-unpacked")
        );
        assert_eq!(
            output_path(Path::new("my.app.exe"), "-x"),
            PathBuf::from("my.app-x.exe")
        );
    }

    #[test]
    fn writes_sibling_without_staging_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Sample.exe");
        let container = Container::new("Sample.exe", ImageKind::IlOnly);

        let written = write_container(
            &ImageAccess::default(),
            &container,
            &input,
            "-unpacked",
            WriteMode::Metadata,
        )
        .unwrap();
        assert_eq!(written, dir.path().join("Sample-unpacked.exe"));
        assert!(written.is_file());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn refuses_to_overwrite_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Sample.exe");
        let container = Container::new("Sample.exe", ImageKind::IlOnly);
        assert!(matches!(
            write_container(
                &ImageAccess::default(),
                &container,
                &input,
                "",
                WriteMode::Metadata
            ),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn failed_save_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("missing").join("Sample.exe");
        let container = Container::new("Sample.exe", ImageKind::IlOnly);
        assert!(write_container(
            &ImageAccess::default(),
            &container,
            &input,
            "-unpacked",
            WriteMode::Metadata
        )
        .is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
