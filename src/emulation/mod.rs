//! Execution of the protected module's own decryption code.
//!
//! Recovery does not reimplement the protection's cryptography. It loads the module into an
//! execution host, runs its initializer and calls its lookup routines, steering the one runtime
//! query those routines depend on: which method is calling.
//!
//! # Key Components
//!
//! ## Host Boundary
//! - [`crate::emulation::ExecutionHost`] - Loads a module for execution
//! - [`crate::emulation::LiveArtifact`] - A loaded module that can be initialized and invoked
//! - [`crate::emulation::DynamicMethod`] - A method body as materialized at runtime
//!
//! ## Loading
//! - [`crate::emulation::ExecutionBridge`] - Loads a module as both container and artifact
//! - [`crate::emulation::LoadedTarget`] - The pair, plus unresolved references and native helper
//! - [`crate::emulation::MappedLoader`] - Memory-mapped, goblin-validated native helpers
//!
//! ## Interception
//! - [`crate::emulation::Interceptor`] - The single-valued redirection slot
//! - [`crate::emulation::ArmGuard`] - Keeps the slot armed for the duration of one lookup
//!
//! ## Sandbox
//! - [`crate::emulation::SandboxHost`] - Table-driven host reading runtime tables from image files
//! - [`crate::emulation::materialize`] - Produces the dynamic method for a static body
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use std::{path::Path, sync::Arc};
//! use ilunpack::{emulation::{ExecutionBridge, Interceptor, SandboxHost}, image::ImageAccess};
//!
//! let access = ImageAccess::default();
//! let bridge = ExecutionBridge::new(&access, &SandboxHost, Interceptor::global());
//! let target = bridge.load(Path::new("protected.exe"))?;
//! target.activate()?;
//! # Ok::<(), ilunpack::Error>(())
//! ```

mod bridge;
mod host;
mod intercept;
mod invoke;
mod native;
mod sandbox;

pub use bridge::{ExecutionBridge, LoadedTarget};
pub use host::{
    DynamicMethod, ExecutionHost, LiveArtifact, RuntimeField, RuntimeHandle, RuntimeMember,
    RuntimeMethod, RuntimeType, Value,
};
pub use intercept::{
    ArmGuard, InterceptionState, Interceptor, MethodIdentity, PostHookResult, DEFAULT_SENTINEL,
};
pub use invoke::invoke_bounded;
pub use native::{helper_candidates, host_machine, MappedLoader, NativeHelper, NativeLoader};
pub use sandbox::{
    materialize, Delegate, LookupKind, MethodEntry, SandboxArtifact, SandboxHost, SandboxTables,
};
