//! # courier-hub
//!
//! In-process fan-out of conversation updates to live viewers.
//!
//! The hub keeps one broadcast topic per conversation (new messages, for
//! open threads) and one per participant (summary changes, for conversation
//! lists). Every viewer holds its own [`Subscription`]; several devices of
//! the same participant each get every update. Releasing or dropping the
//! subscription stops delivery at once and reclaims the topic when its last
//! subscriber leaves.

mod error;
mod hub;
mod registry;

pub use error::HubError;
pub use hub::{ConversationSubscription, HubStats, ParticipantSubscription, SubscriptionHub};
pub use registry::{Subscription, SubscriptionId};
