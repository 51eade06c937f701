//! Removing the protection from a loaded module.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       Unpacking Pipeline                       │
//! ├────────────────────────────────────────────────────────────────┤
//! │  LoadedTarget (Container + LiveArtifact)                       │
//! │           │                                                    │
//! │           ▼                                                    │
//! │  Discovery ── lookup fields, junk set seeding                  │
//! │           │                                                    │
//! │           ▼                                                    │
//! │  Method recovery ── arm interceptor, lookup, translate         │
//! │           │                                                    │
//! │           ▼                                                    │
//! │  String recovery ── lookup, ldstr / nop / nop                  │
//! │           │                                                    │
//! │           ▼                                                    │
//! │  Cleanup ── cctor window, native stubs, junk, resources        │
//! │           │                                                    │
//! │           ▼                                                    │
//! │  UnpackReport, <stem>-unpacked.<ext>                           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`Unpacker`] - Runs the pipeline and writes the result
//! - [`MethodRecoverer`] - Restores virtualized bodies through the live artifact
//! - [`StringRecoverer`] - Replaces string lookups with literals
//! - [`translate()`] - Maps a runtime-materialized body back into the container
//! - [`cleanup()`] - Removes what only the protection used
//! - [`UnpackConfig`] - Sentinel names, timeouts and cleanup toggles
//!
//! # Examples
//!
//! ```rust,no_run
//! use ilunpack::deobfuscation::{UnpackConfig, Unpacker};
//! use std::path::Path;
//!
//! let unpacker = Unpacker::new(UnpackConfig::default());
//! let mut target = unpacker.load(Path::new("Protected.exe"))?;
//! let report = unpacker.unpack(&mut target)?;
//! for failure in &report.stub_failures {
//!     eprintln!("{failure}");
//! }
//! let output = unpacker.save(&target)?;
//! println!("Wrote {}", output.display());
//! # Ok::<(), ilunpack::Error>(())
//! ```

mod cleanup;
mod config;
mod engine;
mod junk;
mod methods;
mod patterns;
mod report;
mod strings;
mod translate;

pub use cleanup::{
    cleanup, excise_cctor_window, find_cctor_window, remove_helper_resources, remove_junk,
    remove_native_stubs, CctorOutcome, CleanupStats,
};
pub use config::{CleanupConfig, UnpackConfig};
pub use engine::Unpacker;
pub use junk::{JunkEntry, JunkSet};
pub use methods::{MethodRecoverer, MethodRecovery};
pub use patterns::{
    find_lookup_entry, find_string_sites, find_stubs, match_string_triple, match_stub,
    LookupEntry, StringSite, StubSite,
};
pub use report::{write_stub_failures, write_unresolved, UnpackReport, UNRESOLVED_HEADING};
pub use strings::{StringFailure, StringRecoverer, StringRecovery};
pub use translate::translate;
