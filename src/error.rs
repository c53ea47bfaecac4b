//! Error handling for pipehub
//!
//! This module defines the crate-wide error type, a Result alias and the
//! per-subsystem error enums that convert into it.
//!
//! The variants follow the failure classes of the control plane:
//!
//! - **Protocol**: malformed envelope, unknown type, oversized payload
//! - **Resolution**: a name found neither in the shared region nor in an archive
//! - **Consistency**: duplicate replies, double registration, refcount underflow
//! - **Transport**: timeouts, dead peers, reset connections
//! - **Application**: a module's compute hook failed

use thiserror::Error;

use crate::message::MessageType;

/// Main error type for pipehub operations
#[derive(Error, Debug)]
pub enum PipehubError {
    /// Envelope or frame could not be accepted
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Object/array graph could not be built or resolved
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    /// Archive save/load failure
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Local queue or network connection failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Parameter update rejected
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    /// Programming error that is logged but not fatal in release builds
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// A module's compute hook failed
    #[error("Application error: {0}")]
    Application(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipehubError>,
    },
}

impl PipehubError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipehubError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the affected link should be torn down.
    pub fn is_fatal_for_link(&self) -> bool {
        match self {
            PipehubError::Protocol(_) => true,
            PipehubError::Transport(e) => !matches!(e, TransportError::Timeout(_)),
            PipehubError::WithContext { source, .. } => source.is_fatal_for_link(),
            _ => false,
        }
    }
}

/// Result type alias for pipehub operations
pub type Result<T> = std::result::Result<T, PipehubError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<PipehubError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

// ── Subsystem errors ─────────────────────────────────────────────────

/// Rejections while decoding or validating a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("bad envelope size {size} (expected {min}..={max})")]
    BadSize { size: usize, min: usize, max: usize },

    #[error("envelope truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("field {field} holds an invalid value {value}")]
    BadField { field: &'static str, value: i64 },

    #[error("message {0:?} does not fit the envelope")]
    Oversized(MessageType),
}

/// Object model failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("attaching {child} to {parent} would create a cycle")]
    Cycle { parent: String, child: String },

    #[error("name {0} is already registered")]
    DuplicateName(String),

    #[error("no object or array named {0}")]
    NotFound(String),

    #[error("array {name} holds {actual:?}, requested {requested:?}")]
    ScalarMismatch {
        name: String,
        actual: crate::object::ScalarType,
        requested: crate::object::ScalarType,
    },

    #[error("invalid meta data: {0}")]
    InvalidMeta(String),
}

/// Archive save/restore failures.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("empty archive blob")]
    Empty,

    #[error("unknown archive format tag {0}")]
    UnknownFormat(u8),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} could not be resolved")]
    Unresolved(String),
}

/// Local queue / network failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The wait expired but the peer is still alive.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The wait expired and the peer process is gone.
    #[error("peer is gone")]
    PeerGone,

    /// The other end of the queue or socket was closed.
    #[error("connection closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameter update rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("parameter {name} is {stored:?}, message carries {declared:?}")]
    TypeMismatch {
        name: String,
        stored: crate::parameter::ParamType,
        declared: crate::parameter::ParamType,
    },

    #[error("parameter {name} does not support range {range:?}")]
    UnsupportedRange {
        name: String,
        range: crate::parameter::RangeType,
    },

    #[error("parameter {0} does not present choices")]
    NotAChoice(String),

    #[error("value for parameter {0} is out of range")]
    OutOfRange(String),

    #[error("module {0} is not running")]
    UnknownModule(crate::id::Id),

    #[error("no parameter named {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipehubError::Config("missing hub id".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing hub id");
    }

    #[test]
    fn test_error_with_context() {
        let err = PipehubError::Consistency("duplicate reply".to_string());
        let with_ctx = err.with_context("Barrier 3");
        assert!(with_ctx.to_string().contains("Barrier 3"));
        assert!(with_ctx.to_string().contains("duplicate reply"));
    }

    #[test]
    fn test_result_ext_converts_subsystem_errors() {
        let res: std::result::Result<(), ProtocolError> = Err(ProtocolError::UnknownType(999));
        let err = res.context("decoding frame").unwrap_err();
        assert!(err.to_string().starts_with("decoding frame"));
        assert!(err.is_fatal_for_link());
    }

    #[test]
    fn test_timeout_is_not_fatal_for_link() {
        let err: PipehubError = TransportError::Timeout(std::time::Duration::from_millis(5)).into();
        assert!(!err.is_fatal_for_link());
        let err: PipehubError = TransportError::PeerGone.into();
        assert!(err.is_fatal_for_link());
    }
}
