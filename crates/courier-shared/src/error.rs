use thiserror::Error;

/// Errors surfaced by the messaging facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Self-conversation, malformed identifiers, or a caller that is not a
    /// participant of the conversation. Rejected before any write.
    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    /// Empty or oversized content, too many attachments.
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// The caller has no valid session.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// The referenced conversation or cursor does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store unreachable, busy or timed out. Safe to retry with the same
    /// idempotency key.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Concurrent writes that the create-or-merge policy could not absorb.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Non-retryable storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl MessagingError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MessagingError::Transient(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, MessagingError>;
