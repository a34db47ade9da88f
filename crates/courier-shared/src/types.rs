use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{KEY_SEPARATOR, MAX_IDEMPOTENCY_KEY_LEN, MAX_PARTICIPANT_ID_LEN};
use crate::error::MessagingError;

/// Opaque, stable account identifier of a conversation participant.
///
/// Ids are validated on construction so that two different pairs of
/// participants can never derive the same conversation key: an id is
/// non-empty, bounded, free of whitespace and control characters, and never
/// contains the key separator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn parse(raw: &str) -> Result<Self, MessagingError> {
        if raw.is_empty() {
            return Err(MessagingError::InvalidConversation(
                "participant id is empty".into(),
            ));
        }
        if raw.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(MessagingError::InvalidConversation(format!(
                "participant id exceeds {MAX_PARTICIPANT_ID_LEN} bytes"
            )));
        }
        if raw.contains(KEY_SEPARATOR) {
            return Err(MessagingError::InvalidConversation(format!(
                "participant id must not contain '{KEY_SEPARATOR}'"
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MessagingError::InvalidConversation(
                "participant id contains whitespace or control characters".into(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned message identifier. Doubles as the idempotency key
/// subscribers use to drop duplicate deliveries, and as the resume cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token making a retried send take effect at most once.
/// Scoped to the sender: two senders may reuse the same token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self, MessagingError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(MessagingError::InvalidContent(format!(
                "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_rejects_separator_and_whitespace() {
        assert!(ParticipantId::parse("alice").is_ok());
        assert!(ParticipantId::parse("").is_err());
        assert!(ParticipantId::parse("a_b").is_err());
        assert!(ParticipantId::parse("a b").is_err());
        assert!(ParticipantId::parse(&"x".repeat(MAX_PARTICIPANT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn participant_deserialization_validates() {
        let ok: ParticipantId = serde_json::from_str("\"u1\"").unwrap();
        assert_eq!(ok.as_str(), "u1");
        assert!(serde_json::from_str::<ParticipantId>("\"u_1\"").is_err());
    }

    #[test]
    fn idempotency_key_is_trimmed() {
        let key = IdempotencyKey::parse("  retry-1 ").unwrap();
        assert_eq!(key.as_str(), "retry-1");
        assert!(IdempotencyKey::parse("   ").is_err());
    }
}
