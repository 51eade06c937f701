//! The container model and the boundary to the on-disk format.
//!
//! # Key Components
//!
//! - [`Container`] - Types, members, reference tables and resources of one module
//! - [`method`] - Editable method bodies and exception handlers
//! - [`token`] - Metadata table row references used throughout .NET
//! - [`ContainerAccess`] - Loading, saving and reference resolution
//!
//! # Examples
//!
//! ```rust
//! use ilunpack::metadata::{Container, ImageKind, WriteMode};
//!
//! let container = Container::new("Sample.exe", ImageKind::Native);
//! assert_eq!(WriteMode::for_image(container.image_kind), WriteMode::Native);
//! ```

mod access;
mod container;

/// Method bodies and exception handling regions
pub mod method;
/// Metadata tokens
pub mod token;

pub use access::{ContainerAccess, DependencyError, WriteMode};
pub use container::{
    AssemblyRef, Checkpoint, Container, FieldAttributes, FieldDef, ImageKind, ImplMap, MemberRef,
    MethodAttributes, MethodDef, NativeSection, Resource, StandAloneSig, TypeAttributes, TypeDef,
    TypeRef, UserString, GLOBAL_TYPE_NAME,
};
