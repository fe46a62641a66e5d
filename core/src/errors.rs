use std::fmt;

use thiserror::Error;

/// Category of a [`FormError`]; decides how the daemon reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown addon, missing environment field, bad arguments, unconfigured fallback.
    Configuration,
    /// The message text cannot be decoded.
    Codec,
    /// The delivery endpoint did not answer in time.
    TransportTimeout,
    /// Nothing is listening at the delivery endpoint.
    TransportRefused,
    /// The host explicitly reported a failed delivery.
    HostRejected,
    /// Unknown or expired session id.
    NotFound,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "Configuration Error",
            ErrorKind::Codec => "Message Format Error",
            ErrorKind::TransportTimeout => "Host Timeout",
            ErrorKind::TransportRefused => "Host Not Running",
            ErrorKind::HostRejected => "Host Rejected Message",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Internal => "Internal Error",
        };
        f.write_str(label)
    }
}

/// Error type shared by every formbridge component.
///
/// `context` holds extra name/value pairs (host response headers, file
/// paths, session ids) that are shown verbatim on the diagnostic page.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct FormError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Vec<(String, String)>,
}

impl FormError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Codec, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a context entry, builder style.
    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((name.into(), value.into()));
        self
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TransportTimeout | ErrorKind::TransportRefused
        )
    }
}

impl From<std::io::Error> for FormError {
    fn from(e: std::io::Error) -> Self {
        FormError::internal(format!("I/O error: {}", e))
    }
}

impl From<serde_json::Error> for FormError {
    fn from(e: serde_json::Error) -> Self {
        FormError::internal(format!("Serialization error: {}", e))
    }
}

/// Result type for formbridge operations
pub type FormResult<T> = Result<T, FormError>;
