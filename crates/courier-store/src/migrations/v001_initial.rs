//! v001 -- Initial schema creation.
//!
//! Creates the conversation index (`conversations`, `conversation_members`)
//! and the append-only `messages` log.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversation index: one row per conversation key
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    key              TEXT PRIMARY KEY NOT NULL,   -- "<low>_<high>"
    participant_low  TEXT NOT NULL,
    participant_high TEXT NOT NULL,
    last_message     TEXT NOT NULL,               -- snippet
    last_message_id  TEXT NOT NULL,               -- UUID v4
    last_message_at  TEXT NOT NULL,               -- RFC-3339, UTC, micros
    last_message_seq INTEGER NOT NULL,
    revision         INTEGER NOT NULL DEFAULT 1,  -- bumped on every mutation
    created_at       TEXT NOT NULL,

    CHECK (participant_low < participant_high)
);

-- ----------------------------------------------------------------
-- Per-member unread counters
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_key TEXT NOT NULL,
    participant_id   TEXT NOT NULL,
    unread_count     INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),

    PRIMARY KEY (conversation_key, participant_id),
    FOREIGN KEY (conversation_key) REFERENCES conversations(key)
        DEFERRABLE INITIALLY DEFERRED
);

CREATE INDEX IF NOT EXISTS idx_members_participant
    ON conversation_members(participant_id);

-- ----------------------------------------------------------------
-- Messages (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    conversation_key TEXT NOT NULL,
    seq              INTEGER NOT NULL,            -- 1-based, gapless per conversation
    sender_id        TEXT NOT NULL,
    recipient_id     TEXT NOT NULL,
    content          TEXT NOT NULL,
    attachments      TEXT NOT NULL DEFAULT '[]',  -- JSON array of references
    created_at       TEXT NOT NULL,               -- RFC-3339, UTC, micros
    read             INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    idempotency_key  TEXT,

    FOREIGN KEY (conversation_key) REFERENCES conversations(key)
        DEFERRABLE INITIALLY DEFERRED
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_key, seq);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency
    ON messages(sender_id, idempotency_key)
    WHERE idempotency_key IS NOT NULL;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
