//! Error types for the script sandbox.

use serde::Serialize;
use thiserror::Error;

use crate::console::ConsoleEntry;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox host.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// QuickJS runtime/context errors (creation, limits, bridge installation)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Host crypto errors surfaced outside the VM
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Script execution failures
    #[error(transparent)]
    Script(#[from] Box<ScriptFailure>),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}

impl From<ScriptFailure> for Error {
    fn from(value: ScriptFailure) -> Self {
        Self::Script(Box::new(value))
    }
}

/// Category of a host crypto failure.
///
/// Inside the VM every kind surfaces as an Error named `CryptoError`; the kind
/// only shapes the message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoErrorKind {
    /// No provider, or the provider lacks the requested capability.
    Unavailable,
    /// Algorithm or format not implemented by the provider.
    NotSupported,
    /// Key usage does not permit the operation.
    InvalidAccess,
    /// Malformed input (bad lengths, bad JWK, missing fields).
    Data,
    /// The primitive itself failed (auth tag mismatch, bad signature input).
    Operation,
    /// Key id unknown, expired, or a key pair where a single key was expected.
    InvalidKey,
}

/// A failure from the host cryptographic provider or the crypto bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CryptoError {
    pub kind: CryptoErrorKind,
    pub message: String,
}

impl CryptoError {
    pub fn new(kind: CryptoErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CryptoErrorKind::Unavailable, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::NotSupported,
            format!("NotSupportedError: {}", message.into()),
        )
    }

    pub fn invalid_access(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::InvalidAccess,
            format!("InvalidAccessError: {}", message.into()),
        )
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::Data,
            format!("DataError: {}", message.into()),
        )
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::Operation,
            format!("OperationError: {}", message.into()),
        )
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::Data,
            format!("SyntaxError: {}", message.into()),
        )
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::new(
            CryptoErrorKind::InvalidKey,
            format!("Invalid key: {}", message.into()),
        )
    }
}

/// A script run that ended in an uncaught exception.
///
/// Console output captured before the failure point is kept so callers can
/// render it next to the error.
#[derive(Error, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("Script execution failed: {message}")]
pub struct ScriptFailure {
    pub message: String,
    pub console_entries: Vec<ConsoleEntry>,
}

impl ScriptFailure {
    pub fn new(message: impl Into<String>, console_entries: Vec<ConsoleEntry>) -> Self {
        Self {
            message: message.into(),
            console_entries,
        }
    }
}
