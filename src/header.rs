//! Header: identity + routing metadata attached to every message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Fixed metadata envelope carried with every message (spec.md §3 Header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Globally unique identifier for this message instance.
    pub uuid: String,
    /// Logical type name, used for routing and subscription lookup.
    pub message_class: String,
    /// Declared schema version; must equal the class version at receive time.
    pub version: u32,
    /// When the message was published.
    pub published_at: DateTime<Utc>,
    /// Opaque identifier of the publishing process.
    pub publisher_pid: String,
    /// Sender entity id. Required and non-empty once published.
    pub from: String,
    /// Recipient entity id. Absent means broadcast.
    pub to: Option<String>,
    /// Reply-to entity id; defaults to `from` when unset.
    pub reply_to: Option<String>,
    /// Name of the serializer used to encode this message.
    pub serializer: String,
}

impl Header {
    /// Construct a fresh header: generates a UUID and stamps the current time.
    pub fn new(message_class: impl Into<String>, from: impl Into<String>, version: u32) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            message_class: message_class.into(),
            version,
            published_at: Utc::now(),
            publisher_pid: std::process::id().to_string(),
            from: from.into(),
            to: None,
            reply_to: None,
            serializer: "json".to_string(),
        }
    }

    /// `reply_to`, defaulting to `from` when unset (spec.md §3).
    pub fn effective_reply_to(&self) -> &str {
        self.reply_to.as_deref().unwrap_or(&self.from)
    }

    /// Whether this header carries no recipient (broadcast).
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Structural validity: non-empty uuid/from/message_class, version >= 1.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.uuid.is_empty() {
            return Err(ValidationError::InvalidHeader("uuid is empty".into()));
        }
        if self.from.is_empty() {
            return Err(ValidationError::InvalidHeader("from is empty".into()));
        }
        if self.message_class.is_empty() {
            return Err(ValidationError::InvalidHeader(
                "message_class is empty".into(),
            ));
        }
        if self.version < 1 {
            return Err(ValidationError::InvalidHeader(
                "version must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Enforce that this header's version matches the class's declared
    /// version (spec.md §3 invariant, §8 law 10).
    pub fn check_version(&self, class_version: u32) -> Result<(), ValidationError> {
        if self.version != class_version {
            return Err(ValidationError::VersionMismatch {
                header: self.version,
                class: class_version,
            });
        }
        Ok(())
    }
}
