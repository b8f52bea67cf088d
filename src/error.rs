//! Error types for the sandbox.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using the sandbox error type.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Caller-supplied handler for errors raised by sandboxed code.
///
/// The sandbox only ever keeps a weak reference to a callback, so dropping the
/// last `Arc` makes it unusable for any later delivery.
pub type ErrorCallback = Arc<dyn Fn(&SandboxError) + Send + Sync>;

/// Everything that can go wrong while constructing, linking, evaluating or
/// invoking a sandboxed module.
///
/// Variants only carry owned strings and paths so the error can be cloned and
/// handed to callbacks and listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    // =========================================================================
    // Construction
    // =========================================================================
    #[error("module realms are not enabled: launch the host with --experimental-vm-modules")]
    CapabilityUnavailable,

    #[error("filepath missing")]
    MissingPath,

    #[error("file does not exist: {0}")]
    FileNotFound(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Initialization
    // =========================================================================
    #[error("failed to read '{path}': {message}")]
    Io { path: PathBuf, message: String },

    #[error("failed to compile sandboxed module: {message}")]
    Compile { message: String },

    #[error("failed to link import '{specifier}': {message}")]
    Link { specifier: String, message: String },

    #[error("sandboxed module threw during evaluation: {message}")]
    Evaluation { message: String },

    #[error("uncaught exception in sandboxed code: {message}")]
    UncaughtException { message: String },

    #[error("unhandled rejection in sandboxed code: {message}")]
    UncaughtRejection { message: String },

    // =========================================================================
    // Invocation
    // =========================================================================
    #[error("function name not exist: {name}")]
    FunctionNotFound { name: String },

    #[error("sandboxed function threw: {message}")]
    Invocation { message: String },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    #[error("no evaluated module: call initialize() first")]
    NotEvaluated,

    #[error("sandbox already initialized")]
    AlreadyInitialized,

    #[error("sandbox has been destroyed")]
    Destroyed,

    #[error("realm worker unavailable: {0}")]
    RealmUnavailable(String),
}

impl SandboxError {
    /// Whether the error was produced by code running inside the realm (as
    /// opposed to the host failing to set the realm up).
    pub fn is_sandboxed(&self) -> bool {
        matches!(
            self,
            SandboxError::Evaluation { .. }
                | SandboxError::UncaughtException { .. }
                | SandboxError::UncaughtRejection { .. }
                | SandboxError::Invocation { .. }
                | SandboxError::FunctionNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandboxed_classification() {
        assert!(SandboxError::Evaluation { message: "x".into() }.is_sandboxed());
        assert!(SandboxError::FunctionNotFound { name: "f".into() }.is_sandboxed());
        assert!(!SandboxError::MissingPath.is_sandboxed());
        assert!(!SandboxError::Link {
            specifier: "left-pad".into(),
            message: "not found".into()
        }
        .is_sandboxed());
    }

    #[test]
    fn test_messages_name_the_subject() {
        let err = SandboxError::Link {
            specifier: "./data.json".into(),
            message: "no such file".into(),
        };
        assert!(err.to_string().contains("./data.json"));

        let err = SandboxError::FunctionNotFound { name: "render".into() };
        assert!(err.to_string().contains("render"));
    }
}
