use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::trace;

use courier_shared::{ConversationKey, ParticipantId};
use courier_store::{ConversationSummary, Message};

use crate::registry::{Registry, Subscription};

/// Live stream of messages appended to one conversation.
pub type ConversationSubscription = Subscription<ConversationKey, Message>;

/// Live stream of summary changes for every conversation of a participant.
pub type ParticipantSubscription = Subscription<ParticipantId, ConversationSummary>;

/// Fan-out point between the write path and live viewers.
///
/// Cloning the hub is cheap and shares the same topics. Publishing to a
/// topic without subscribers is a no-op.
#[derive(Clone)]
pub struct SubscriptionHub {
    conversations: Arc<Registry<ConversationKey, Message>>,
    participants: Arc<Registry<ParticipantId, ConversationSummary>>,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub conversation_topics: usize,
    pub participant_topics: usize,
}

impl SubscriptionHub {
    /// Create a hub whose topics buffer up to `capacity` undelivered
    /// updates per subscriber before it is reported as lagged.
    pub fn new(capacity: usize) -> Self {
        let next_id = Arc::new(AtomicU64::new(1));
        Self {
            conversations: Arc::new(Registry::new("conversation", capacity, next_id.clone())),
            participants: Arc::new(Registry::new("participant", capacity, next_id)),
        }
    }

    /// Subscribe to messages appended to `key` from now on.
    pub fn subscribe_conversation(&self, key: &ConversationKey) -> ConversationSubscription {
        self.conversations.subscribe(key)
    }

    /// Subscribe to summary changes of every conversation `participant`
    /// belongs to, including conversations created later.
    pub fn subscribe_participant(&self, participant: &ParticipantId) -> ParticipantSubscription {
        self.participants.subscribe(participant)
    }

    /// Deliver a freshly appended message to the conversation's viewers.
    pub fn publish_message(&self, message: &Message) -> usize {
        let delivered = self
            .conversations
            .publish(&message.conversation_key, message.clone());
        trace!(
            key = %message.conversation_key,
            seq = message.seq,
            delivered,
            "message published"
        );
        delivered
    }

    /// Deliver a summary change to both participants' conversation lists.
    pub fn publish_summary(&self, summary: &ConversationSummary) -> usize {
        let delivered: usize = summary
            .participants
            .iter()
            .map(|participant| self.participants.publish(participant, summary.clone()))
            .sum();
        trace!(
            key = %summary.key,
            revision = summary.revision,
            delivered,
            "summary published"
        );
        delivered
    }

    /// Number of live subscriptions on a conversation topic.
    pub fn conversation_subscribers(&self, key: &ConversationKey) -> usize {
        self.conversations.subscriber_count(key)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            conversation_topics: self.conversations.topic_count(),
            participant_topics: self.participants.topic_count(),
        }
    }
}

impl fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("SubscriptionHub")
            .field("conversation_topics", &stats.conversation_topics)
            .field("participant_topics", &stats.participant_topics)
            .finish()
    }
}
