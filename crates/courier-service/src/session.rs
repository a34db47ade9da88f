use chrono::{DateTime, Utc};

use courier_shared::{MessagingError, ParticipantId, Result};

/// Caller identity as established by the identity/session collaborator.
///
/// The facade trusts the participant id it carries; authenticating the
/// credential behind it happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    participant: Option<ParticipantId>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A session for `participant` without expiry.
    pub fn authenticated(participant: ParticipantId) -> Self {
        Self {
            participant: Some(participant),
            expires_at: None,
        }
    }

    /// A session for `participant` valid until `expires_at`.
    pub fn expiring(participant: ParticipantId, expires_at: DateTime<Utc>) -> Self {
        Self {
            participant: Some(participant),
            expires_at: Some(expires_at),
        }
    }

    /// A caller without a session.
    pub fn anonymous() -> Self {
        Self {
            participant: None,
            expires_at: None,
        }
    }

    /// The authenticated participant, or `Unauthenticated`.
    pub fn participant(&self) -> Result<&ParticipantId> {
        let participant = self.participant.as_ref().ok_or(MessagingError::Unauthenticated)?;
        match self.expires_at {
            Some(at) if at <= Utc::now() => Err(MessagingError::Unauthenticated),
            _ => Ok(participant),
        }
    }
}
