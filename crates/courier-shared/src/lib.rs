//! # courier-shared
//!
//! Types shared by every Courier crate: participant and message
//! identifiers, the symmetric conversation key, protocol limits and the
//! error taxonomy surfaced to callers of the messaging facade.

pub mod constants;
pub mod error;
pub mod identity;
pub mod types;

pub use error::{MessagingError, Result};
pub use identity::{derive_key, ConversationKey};
pub use types::{IdempotencyKey, MessageId, ParticipantId};
