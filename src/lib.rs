// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'emulation/native.rs' uses mmap to map native helpers into memory

//! # ilunpack
//!
//! An execution-driven unpacker for .NET executables protected by ILProtector.
//!
//! The protection replaces method bodies with small stubs that ask a native-backed lookup routine
//! for the real body at run time, and hides string literals behind a second lookup. `ilunpack`
//! loads the protected module twice, once as an editable container and once as a live artifact,
//! asks the lookups for every body and literal, writes them back, removes the protection's
//! scaffolding and saves the result as `<name>-unpacked.<ext>`.
//!
//! ## Features
//!
//! - **Method devirtualization** - Stub bodies are replaced by the bodies the runtime would run
//! - **String decryption** - Lookup triples collapse to `ldstr`
//! - **Caller interception** - A rendezvous slot tells the lookup which stub is asking
//! - **Cleanup** - Lookup fields, helper types, native stubs and embedded helpers are removed
//! - **Bounded lookups** - A hung lookup costs one stub, not the run
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ilunpack::deobfuscation::{UnpackConfig, Unpacker};
//! use std::path::Path;
//!
//! let unpacker = Unpacker::new(UnpackConfig::default());
//! let report = unpacker.run(Path::new("Protected.exe"))?;
//! println!("{}", report.summary());
//! # Ok::<(), ilunpack::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - The container model and the [`metadata::ContainerAccess`] boundary
//! - [`assembly`] - CIL opcodes, decoder and encoder
//! - [`emulation`] - Execution host, live artifact, interception and bounded invocation
//! - [`deobfuscation`] - Recovery, cleanup and the [`deobfuscation::Unpacker`] pipeline
//! - [`image`] - The JSON image format and its [`metadata::ContainerAccess`] implementation
//! - [`output`] - Output naming and staged writes
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result<T>`]. Loading, a missing method lookup and saving
//! are fatal; everything else is recorded in the [`deobfuscation::UnpackReport`].

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// CIL instructions based on ECMA-335 Partition III
pub mod assembly;

/// Removing the protection: recovery, cleanup and the unpacking pipeline
pub mod deobfuscation;

/// Execution host abstraction, interception and the sandbox host
pub mod emulation;

/// JSON image files
pub mod image;

/// The container model
pub mod metadata;

/// Output naming and writing
pub mod output;

/// `ilunpack` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `ilunpack` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use ilunpack::{deobfuscation::Unpacker, Error};
/// use std::path::Path;
///
/// match Unpacker::default().run(Path::new("Protected.exe")) {
///     Ok(report) => println!("{}", report.summary()),
///     Err(Error::RequiredFieldMissing(field)) => println!("Not protected: no {field} field"),
///     Err(e) => println!("Error: {e}"),
/// }
/// ```
pub use error::Error;

pub use deobfuscation::{UnpackConfig, UnpackReport, Unpacker};
pub use metadata::{token::Token, Container};
