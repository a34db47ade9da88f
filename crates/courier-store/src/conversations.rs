//! The conversation index: one summary row per conversation plus a
//! per-member unread counter.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, TransactionBehavior};

use courier_shared::constants::SNIPPET_MAX_CHARS;
use courier_shared::{ConversationKey, ParticipantId};

use crate::database::{
    format_ts, parse_key, parse_message_id, parse_participant, parse_ts, to_u64, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{ConversationSummary, Message};

const SUMMARY_SELECT: &str = "SELECT c.key, c.participant_low, c.participant_high,
        c.last_message, c.last_message_id, c.last_message_at, c.last_message_seq,
        c.revision, c.created_at,
        (SELECT unread_count FROM conversation_members
          WHERE conversation_key = c.key AND participant_id = c.participant_low),
        (SELECT unread_count FROM conversation_members
          WHERE conversation_key = c.key AND participant_id = c.participant_high)
     FROM conversations c";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch the summary of a single conversation.
    pub fn get_summary(&self, key: &ConversationKey) -> Result<ConversationSummary> {
        summary_in(self.conn(), key)
    }

    /// Conversations `participant` belongs to, most recently active first.
    pub fn list_for_participant(
        &self,
        participant: &ParticipantId,
    ) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SUMMARY_SELECT}
             JOIN conversation_members m ON m.conversation_key = c.key
             WHERE m.participant_id = ?1
             ORDER BY c.last_message_at DESC, c.key ASC"
        ))?;

        let rows = stmt.query_map(params![participant.as_str()], row_to_summary)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Reset `reader`'s unread counter and flag the messages they received
    /// as read.
    ///
    /// Returns the updated summary when something changed and `None` when
    /// the conversation was already fully read.
    pub fn mark_read(
        &mut self,
        key: &ConversationKey,
        reader: &ParticipantId,
    ) -> Result<Option<ConversationSummary>> {
        if !key.contains(reader) {
            return Err(StoreError::InvalidInput(format!(
                "{reader} is not a participant of {key}"
            )));
        }

        let key_str = key.to_string();
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !exists(&tx, key)? {
            return Err(StoreError::NotFound(format!("conversation {key}")));
        }

        let counter_reset = tx.execute(
            "UPDATE conversation_members SET unread_count = 0
             WHERE conversation_key = ?1 AND participant_id = ?2 AND unread_count > 0",
            params![key_str, reader.as_str()],
        )?;
        let flagged = tx.execute(
            "UPDATE messages SET read = 1
             WHERE conversation_key = ?1 AND recipient_id = ?2 AND read = 0",
            params![key_str, reader.as_str()],
        )?;

        if counter_reset == 0 && flagged == 0 {
            return Ok(None);
        }

        tx.execute(
            "UPDATE conversations SET revision = revision + 1 WHERE key = ?1",
            params![key_str],
        )?;
        let summary = summary_in(&tx, key)?;
        tx.commit()?;

        tracing::debug!(key = %key_str, reader = %reader, flagged, "conversation marked read");
        Ok(Some(summary))
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers used by the message log
// ---------------------------------------------------------------------------

/// Create-or-merge the index row for a freshly appended message.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE` per table: two first messages
/// racing on the same key converge to one row, the second write merging
/// into the first instead of creating a duplicate. The recipient's counter
/// is incremented; the sender's is left untouched.
pub(crate) fn upsert_on_append(conn: &Connection, message: &Message) -> Result<()> {
    let key_str = message.conversation_key.to_string();
    let [low, high] = message.conversation_key.participants();
    let at = format_ts(&message.created_at);

    conn.execute(
        "INSERT INTO conversations (key, participant_low, participant_high, last_message,
                                    last_message_id, last_message_at, last_message_seq,
                                    revision, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?6)
         ON CONFLICT(key) DO UPDATE SET
             last_message     = excluded.last_message,
             last_message_id  = excluded.last_message_id,
             last_message_at  = excluded.last_message_at,
             last_message_seq = excluded.last_message_seq,
             revision         = conversations.revision + 1
         WHERE excluded.last_message_seq > conversations.last_message_seq",
        params![
            key_str,
            low.as_str(),
            high.as_str(),
            snippet(&message.content),
            message.id.to_string(),
            at,
            message.seq as i64,
        ],
    )?;

    conn.execute(
        "INSERT INTO conversation_members (conversation_key, participant_id, unread_count)
         VALUES (?1, ?2, 0), (?1, ?3, 0)
         ON CONFLICT(conversation_key, participant_id) DO NOTHING",
        params![key_str, low.as_str(), high.as_str()],
    )?;

    conn.execute(
        "UPDATE conversation_members SET unread_count = unread_count + 1
         WHERE conversation_key = ?1 AND participant_id = ?2",
        params![key_str, message.recipient_id.as_str()],
    )?;

    Ok(())
}

pub(crate) fn summary_in(conn: &Connection, key: &ConversationKey) -> Result<ConversationSummary> {
    conn.query_row(
        &format!("{SUMMARY_SELECT} WHERE c.key = ?1"),
        params![key.to_string()],
        row_to_summary,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("conversation {key}")),
        other => StoreError::Sqlite(other),
    })
}

pub(crate) fn exists(conn: &Connection, key: &ConversationKey) -> Result<bool> {
    let found: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM conversations WHERE key = ?1)",
        params![key.to_string()],
        |row| row.get(0),
    )?;
    Ok(found != 0)
}

/// Shorten `content` to at most [`SNIPPET_MAX_CHARS`] characters on a char
/// boundary, marking the cut with an ellipsis.
pub fn snippet(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= SNIPPET_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(SNIPPET_MAX_CHARS - 1).collect();
    cut.push('…');
    cut
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let key: String = row.get(0)?;
    let low: String = row.get(1)?;
    let high: String = row.get(2)?;
    let last_message: String = row.get(3)?;
    let last_message_id: String = row.get(4)?;
    let last_message_at: String = row.get(5)?;
    let last_message_seq: i64 = row.get(6)?;
    let revision: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    let unread_low: Option<i64> = row.get(9)?;
    let unread_high: Option<i64> = row.get(10)?;

    let low = parse_participant(1, &low)?;
    let high = parse_participant(2, &high)?;

    let mut unread = BTreeMap::new();
    unread.insert(low.clone(), to_count(9, unread_low)?);
    unread.insert(high.clone(), to_count(10, unread_high)?);

    Ok(ConversationSummary {
        key: parse_key(0, &key)?,
        participants: [low, high],
        last_message,
        last_message_id: parse_message_id(4, &last_message_id)?,
        last_message_at: parse_ts(5, &last_message_at)?,
        last_message_seq: to_u64(6, last_message_seq)?,
        unread,
        revision: to_u64(7, revision)?,
        created_at: parse_ts(8, &created_at)?,
    })
}

fn to_count(idx: usize, value: Option<i64>) -> rusqlite::Result<u32> {
    u32::try_from(value.unwrap_or(0)).map_err(|e| crate::database::conversion_err(idx, e))
}
