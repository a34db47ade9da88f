//! Conversation identity.
//!
//! A two-party conversation is addressed by a key derived from its
//! participants alone, so either side can resolve the same conversation
//! without a lookup round-trip.

use serde::{Deserialize, Serialize};

use crate::constants::KEY_SEPARATOR;
use crate::error::MessagingError;
use crate::types::ParticipantId;

/// Canonical, symmetric key of a two-party conversation:
/// `sorted(a, b)` joined by [`KEY_SEPARATOR`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey {
    low: ParticipantId,
    high: ParticipantId,
}

/// Derive the conversation key for `a` and `b`.
///
/// Argument order does not matter. Fails with `InvalidConversation` when
/// both ids are the same participant.
pub fn derive_key(a: &ParticipantId, b: &ParticipantId) -> Result<ConversationKey, MessagingError> {
    if a == b {
        return Err(MessagingError::InvalidConversation(
            "a conversation needs two distinct participants".into(),
        ));
    }
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(ConversationKey {
        low: low.clone(),
        high: high.clone(),
    })
}

impl ConversationKey {
    /// Parse a key from its textual form. Only the canonical form is
    /// accepted: two valid, distinct, sorted participant ids.
    pub fn parse(raw: &str) -> Result<Self, MessagingError> {
        let (left, right) = raw.split_once(KEY_SEPARATOR).ok_or_else(|| {
            MessagingError::InvalidConversation(format!("malformed conversation key: {raw}"))
        })?;
        let low = ParticipantId::parse(left)?;
        let high = ParticipantId::parse(right)?;
        let key = derive_key(&low, &high)?;
        if key.low != low {
            return Err(MessagingError::InvalidConversation(format!(
                "conversation key is not canonical: {raw}"
            )));
        }
        Ok(key)
    }

    /// Both participants in canonical order.
    pub fn participants(&self) -> [&ParticipantId; 2] {
        [&self.low, &self.high]
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        &self.low == participant || &self.high == participant
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

impl std::str::FromStr for ConversationKey {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.low, KEY_SEPARATOR, self.high)
    }
}
