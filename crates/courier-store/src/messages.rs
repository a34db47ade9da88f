//! The append-only message log.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use courier_shared::constants::MAX_PAGE_SIZE;
use courier_shared::{derive_key, ConversationKey, IdempotencyKey, MessageId, ParticipantId};

use crate::conversations;
use crate::database::{
    format_ts, parse_key, parse_message_id, parse_participant, parse_ts, to_u64, Database,
};
use crate::error::{Result, StoreError};
use crate::models::{AppendOutcome, Message, NewMessage};

const MESSAGE_COLUMNS: &str = "id, conversation_key, seq, sender_id, recipient_id, content, \
     attachments, created_at, read, idempotency_key";

impl Database {
    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Append a message and fold it into the conversation index.
    ///
    /// Both writes happen in one `IMMEDIATE` transaction: either the message
    /// and its index update are both visible, or neither is. The message gets
    /// the next sequence number of its conversation and a creation time no
    /// earlier than its predecessor's.
    ///
    /// When `idempotency_key` matches an earlier message of the same sender,
    /// that message is returned with `duplicate = true` and nothing is
    /// written.
    pub fn append_message(&mut self, new: &NewMessage, now: DateTime<Utc>) -> Result<AppendOutcome> {
        validate_new_message(new)?;

        let key_str = new.conversation_key.to_string();
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(ref idem) = new.idempotency_key {
            if let Some(existing) = find_by_idempotency_key(&tx, &new.sender_id, idem)? {
                if existing.conversation_key != new.conversation_key {
                    return Err(StoreError::IdempotencyMismatch(idem.to_string()));
                }
                let summary = conversations::summary_in(&tx, &existing.conversation_key)?;
                tracing::debug!(
                    key = %key_str,
                    id = %existing.id,
                    idempotency_key = %idem,
                    "duplicate send, returning existing message"
                );
                return Ok(AppendOutcome {
                    message: existing,
                    summary,
                    duplicate: true,
                });
            }
        }

        let previous: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, created_at FROM messages
                 WHERE conversation_key = ?1
                 ORDER BY seq DESC LIMIT 1",
                params![key_str],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let now = now.trunc_subsecs(6);
        let (seq, created_at) = match previous {
            Some((last_seq, last_at)) => {
                let last_at = parse_ts(1, &last_at)?;
                (to_u64(0, last_seq)? + 1, now.max(last_at))
            }
            None => (1, now),
        };

        let message = Message {
            id: MessageId::new(),
            conversation_key: new.conversation_key.clone(),
            seq,
            sender_id: new.sender_id.clone(),
            recipient_id: new.recipient_id.clone(),
            content: new.content.clone(),
            attachments: new.attachments.clone(),
            created_at,
            read: false,
            idempotency_key: new.idempotency_key.clone(),
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_key, seq, sender_id, recipient_id,
                                   content, attachments, created_at, read, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                message.id.to_string(),
                key_str,
                seq as i64,
                message.sender_id.as_str(),
                message.recipient_id.as_str(),
                message.content,
                serde_json::to_string(&message.attachments)?,
                format_ts(&message.created_at),
                message.idempotency_key.as_ref().map(|k| k.as_str()),
            ],
        )?;

        conversations::upsert_on_append(&tx, &message)?;
        let summary = conversations::summary_in(&tx, &message.conversation_key)?;

        tx.commit()?;

        tracing::debug!(key = %key_str, seq, id = %message.id, "message appended");

        Ok(AppendOutcome {
            message,
            summary,
            duplicate: false,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Load a page of history, oldest-first within the page.
    ///
    /// Without `before` the page holds the most recent `limit` messages;
    /// with `before` it holds the `limit` messages preceding that message.
    /// Reading an unknown conversation fails with `NotFound`.
    pub fn fetch_window(
        &self,
        key: &ConversationKey,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        if !conversations::exists(self.conn(), key)? {
            return Err(StoreError::NotFound(format!("conversation {key}")));
        }

        let upper = match before {
            Some(id) => self.resolve_cursor(key, id)? as i64,
            None => i64::MAX,
        };

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_key = ?1 AND seq < ?2
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![key.to_string(), upper, clamp_limit(limit)],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Messages with `seq > after_seq`, oldest first. Used to resync live
    /// streams; an unknown conversation simply yields nothing.
    pub fn messages_after(
        &self,
        key: &ConversationKey,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_key = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![key.to_string(), after_seq as i64, clamp_limit(limit)],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Resolve a message-id cursor to its sequence number within `key`.
    pub fn resolve_cursor(&self, key: &ConversationKey, id: MessageId) -> Result<u64> {
        let seq: i64 = self
            .conn()
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1 AND conversation_key = ?2",
                params![id.to_string(), key.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("message {id} in conversation {key}"))
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(to_u64(0, seq)?)
    }

    /// Sequence number of the newest message of `key` (0 when empty).
    pub fn head_seq(&self, key: &ConversationKey) -> Result<u64> {
        let seq: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_key = ?1",
            params![key.to_string()],
            |row| row.get(0),
        )?;
        Ok(to_u64(0, seq)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_new_message(new: &NewMessage) -> Result<()> {
    let implied = derive_key(&new.sender_id, &new.recipient_id)
        .map_err(|e| StoreError::InvalidInput(e.to_string()))?;
    if implied != new.conversation_key {
        return Err(StoreError::InvalidInput(format!(
            "{} and {} are not the participants of {}",
            new.sender_id, new.recipient_id, new.conversation_key
        )));
    }
    if new.content.trim().is_empty() {
        return Err(StoreError::InvalidInput("message content is empty".into()));
    }
    Ok(())
}

fn find_by_idempotency_key(
    conn: &Connection,
    sender: &ParticipantId,
    key: &IdempotencyKey,
) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE sender_id = ?1 AND idempotency_key = ?2"
            ),
            params![sender.as_str(), key.as_str()],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let key: String = row.get(1)?;
    let seq: i64 = row.get(2)?;
    let sender: String = row.get(3)?;
    let recipient: String = row.get(4)?;
    let content: String = row.get(5)?;
    let attachments: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let read: bool = row.get(8)?;
    let idempotency_key: Option<String> = row.get(9)?;

    let attachments: Vec<String> = serde_json::from_str(&attachments)
        .map_err(|e| crate::database::conversion_err(6, e))?;
    let idempotency_key = idempotency_key
        .map(|k| IdempotencyKey::parse(&k))
        .transpose()
        .map_err(|e| crate::database::conversion_err(9, e))?;

    Ok(Message {
        id: parse_message_id(0, &id)?,
        conversation_key: parse_key(1, &key)?,
        seq: to_u64(2, seq)?,
        sender_id: parse_participant(3, &sender)?,
        recipient_id: parse_participant(4, &recipient)?,
        content,
        attachments,
        created_at: parse_ts(7, &created_at)?,
        read,
        idempotency_key,
    })
}
