//! Native helper libraries shipped next to protected executables.
//!
//! The protection's runtime lives in a native DLL (`Protect32.dll` / `Protect64.dll`) that the
//! module initializer binds to. Helpers are memory-mapped and validated as PE DLLs for the host
//! machine before they are handed to the artifact.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use goblin::pe::{header, PE};
use log::debug;
use memmap2::Mmap;

use crate::Result;

/// A native helper library kept resident for the rest of the run.
pub struct NativeHelper {
    /// File name
    pub name: String,
    /// Full path
    pub path: PathBuf,
    /// COFF machine type
    pub machine: u16,
    data: Mmap,
}

impl NativeHelper {
    /// The mapped image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

impl fmt::Debug for NativeHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHelper")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("machine", &format_args!("{:#06x}", self.machine))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Loads one native helper candidate.
pub trait NativeLoader {
    /// Load and validate the library at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or is not a usable DLL.
    fn load(&self, path: &Path) -> Result<NativeHelper>;
}

/// Maps candidates from disk and checks them with goblin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedLoader {
    /// Required COFF machine type, `None` to accept any
    pub machine: Option<u16>,
}

impl Default for MappedLoader {
    fn default() -> Self {
        MappedLoader {
            machine: host_machine(),
        }
    }
}

impl NativeLoader for MappedLoader {
    fn load(&self, path: &Path) -> Result<NativeHelper> {
        let file = fs::File::open(path)?;
        // SAFETY: the map is read-only and owned by the returned helper. Helpers are not
        // modified on disk while the unpacker runs.
        let data = unsafe { Mmap::map(&file) }?;

        let pe = PE::parse(&data)?;
        if !pe.is_lib {
            return Err(malformed_error!("{} is not a DLL", path.display()));
        }

        let machine = pe.header.coff_header.machine;
        if let Some(expected) = self.machine {
            if machine != expected {
                return Err(malformed_error!(
                    "{} targets machine {:#06x}, host is {:#06x}",
                    path.display(),
                    machine,
                    expected
                ));
            }
        }

        Ok(NativeHelper {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            machine,
            data,
        })
    }
}

/// COFF machine type of the running process, if it is one helpers exist for.
#[must_use]
pub fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(header::COFF_MACHINE_X86_64)
    } else if cfg!(target_arch = "x86") {
        Some(header::COFF_MACHINE_X86)
    } else if cfg!(target_arch = "aarch64") {
        Some(header::COFF_MACHINE_ARM64)
    } else {
        None
    }
}

/// Native helper candidates in `directory`, best first.
///
/// A candidate is a file whose name starts with `prefix` and ends with `suffix`, both compared
/// case-insensitively. Candidates whose name contains the host pointer width (`64` or `32`)
/// come first, the rest follow in name order.
///
/// # Errors
/// Returns [`crate::Error::FileError`] if the directory cannot be read.
pub fn helper_candidates(directory: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let prefix = prefix.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    let width = if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        "32"
    };

    let mut candidates = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            candidates.push((!name.contains(width), name, entry.path()));
        }
    }

    candidates.sort();
    debug!("Found {} native helper candidates", candidates.len());
    Ok(candidates.into_iter().map(|(_, _, path)| path).collect())
}
