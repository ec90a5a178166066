//! Event layer errors.

use warden_types::EventTypeId;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The key cannot name an event type.
    #[error("invalid event key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    /// No event type is registered under this key.
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    /// No key maps to this id.
    #[error("no event type registered with id {0}")]
    NotFound(EventTypeId),
    /// More than one key maps to this id. Indicates a registry bug.
    #[error("event id {id} is shared by keys {keys:?}")]
    Inconsistent { id: EventTypeId, keys: Vec<String> },
}

pub type Result<T> = std::result::Result<T, EventError>;
