use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which covers every failure the unpacker can report.
///
/// The variants fall into three classes, which decide how the pipeline reacts to them:
///
/// ## Fatal
/// - [`Error::Load`] - The protected container is missing or cannot be parsed
/// - [`Error::RequiredFieldMissing`] - The method lookup entry point is absent
/// - [`Error::Serialization`] - The rewritten container could not be written
///
/// ## Collected
/// - [`Error::DependencyResolution`] - A referenced assembly could not be located
///
/// ## Local to one recovery site
/// - [`Error::StubRecovery`] - Lookup or translation failed for one stub
/// - [`Error::Host`], [`Error::Timeout`], [`Error::Translation`] - The causes wrapped by it
///
/// # Examples
///
/// ```rust,no_run
/// use ilunpack::{Error, image::ImageAccess, metadata::ContainerAccess};
/// use std::path::Path;
///
/// match ImageAccess::default().load(Path::new("protected.exe")) {
///     Ok(container) => println!("Loaded {}", container.name),
///     Err(Error::Load { path, message }) => eprintln!("{}: {}", path.display(), message),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The container could not be loaded.
    ///
    /// Raised when the input file is absent or its contents are not a valid container. This
    /// aborts the run before any recovery step.
    #[error("Failed to load '{}': {message}", path.display())]
    Load {
        /// Path of the container that failed to load
        path: PathBuf,
        /// Reason reported by the container access layer
        message: String,
    },

    /// A referenced assembly could not be resolved.
    ///
    /// These are collected while loading and reported together. The run continues with
    /// best-effort resolution.
    #[error("Could not resolve '{reference}'")]
    DependencyResolution {
        /// Full display name of the unresolved reference
        reference: String,
    },

    /// A sentinel entry point of the protection could not be located.
    ///
    /// The method lookup field on the global type, together with the `Invoke` method on the
    /// field's type, is required for any method recovery to take place.
    #[error("Cannot find {0} field!")]
    RequiredFieldMissing(String),

    /// Recovering one stub method failed.
    ///
    /// The stub keeps its protected body; the pipeline moves on to the next stub.
    #[error("{source}")]
    StubRecovery {
        /// Full name of the method whose body could not be recovered
        method: String,
        /// Metadata token of the method
        token: Token,
        /// Underlying cause (lookup, timeout or translation failure)
        source: Box<Error>,
    },

    /// Writing the rewritten container failed.
    #[error("Failed to write '{}': {message}", path.display())]
    Serialization {
        /// Target path of the failed write
        path: PathBuf,
        /// Reason reported by the writer
        message: String,
    },

    /// The data is damaged and could not be parsed.
    ///
    /// Used by the IL decoder and the exception section parser. The error includes the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing a byte stream.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// A runtime-only operand of a materialized method has no static counterpart.
    #[error("Cannot translate operand: {0}")]
    Translation(String),

    /// The live artifact raised an exception while executing its own code.
    #[error("{0}")]
    Host(String),

    /// A lookup inside the live artifact did not return in time.
    #[error("Lookup did not complete within {0:?}")]
    Timeout(Duration),

    /// A lookup was requested before the module initializer ran.
    #[error("The module initializer has not been run")]
    NotActivated,

    /// The interception slot was armed again by the thread already holding it.
    ///
    /// Arm, invoke and disarm form a critical section that is deliberately non-reentrant.
    #[error("Interception slot is already armed by this thread")]
    InterceptorReentered,

    /// The static constructor does not have the expected protection layout.
    ///
    /// The constructor is left unmodified when this is returned.
    #[error("Unexpected static constructor layout: {0}")]
    CctorLayout(String),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate while validating a native helper image.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Error from serde_json while reading or writing a container image.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
