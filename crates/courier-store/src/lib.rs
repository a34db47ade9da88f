//! # courier-store
//!
//! Durable storage for Courier conversations, backed by SQLite.
//!
//! Two logical tables carry the state: the append-only message log and the
//! conversation index (one summary row per conversation plus a per-member
//! unread counter). Every append updates both inside one `IMMEDIATE`
//! transaction, so readers never observe an index that disagrees with the
//! log. The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`; async callers drive it from a blocking pool.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
