//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to subscribers and the HTTP layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::{ConversationKey, IdempotencyKey, MessageId, ParticipantId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single direct message. Immutable once appended, except for `read`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    /// Position in the conversation, starting at 1 with no gaps.
    pub seq: u64,
    pub sender_id: ParticipantId,
    pub recipient_id: ParticipantId,
    pub content: String,
    /// Opaque attachment references, in the order the sender gave them.
    pub attachments: Vec<String>,
    /// Server-assigned; non-decreasing within a conversation.
    pub created_at: DateTime<Utc>,
    pub read: bool,
    #[serde(default, skip_serializing)]
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Input to [`Database::append_message`](crate::Database::append_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_key: ConversationKey,
    pub sender_id: ParticipantId,
    pub recipient_id: ParticipantId,
    pub content: String,
    pub attachments: Vec<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Result of an append: the stored message and the index row as it stands
/// after the same transaction.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub summary: ConversationSummary,
    /// `true` when the idempotency key matched an earlier message and
    /// nothing was written.
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// Conversation index
// ---------------------------------------------------------------------------

/// Summary row of a conversation, as shown in a participant's conversation
/// list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub key: ConversationKey,
    /// Both participants in canonical (sorted) order.
    pub participants: [ParticipantId; 2],
    /// Snippet of the most recent message content.
    pub last_message: String,
    pub last_message_id: MessageId,
    pub last_message_at: DateTime<Utc>,
    pub last_message_seq: u64,
    /// Messages sent to each participant that they have not marked read.
    pub unread: BTreeMap<ParticipantId, u32>,
    /// Incremented on every mutation of this row.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn unread_for(&self, participant: &ParticipantId) -> u32 {
        self.unread.get(participant).copied().unwrap_or(0)
    }
}
