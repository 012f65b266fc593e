//! Unified error type for dispatchbus.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of failure the bus can produce, per the error taxonomy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport not configured")]
    TransportNotConfigured,

    #[error("serializer not configured")]
    SerializerNotConfigured,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("unknown message class: {0}")]
    UnknownMessageClass(String),

    #[error("received message not subscribed: {0}")]
    ReceivedMessageNotSubscribed(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    /// Returned (not raised as an exception) when a circuit is open. Callers
    /// that need the non-exception "marker" semantics of spec.md §4.4 should
    /// match on this variant rather than treat it as a hard failure.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("dead-letter queue write failed: {0}")]
    DlqWrite(String),

    #[error("transport '{0}' is not registered")]
    UnknownTransport(String),

    #[error("subscribe not supported by this transport")]
    SubscribeNotSupported,

    #[error("argument error: {0}")]
    Argument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Validation failure detail, raised by `Message::validate` and the header
/// version gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required property '{0}' is missing")]
    MissingRequired(String),

    #[error("property '{field}' failed validation: {reason}")]
    InvalidProperty { field: String, reason: String },

    #[error("version mismatch: header has {header}, class declares {class}")]
    VersionMismatch { header: u32, class: u32 },

    #[error("header invariant violated: {0}")]
    InvalidHeader(String),
}
