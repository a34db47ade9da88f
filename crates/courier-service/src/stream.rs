//! Resumable live views built on top of the subscription hub.
//!
//! The hub alone is at-least-once and may hand a subscriber messages out of
//! order when two sends to the same conversation publish concurrently, or
//! drop updates when the subscriber lags. The streams here close those gaps
//! against the store: a [`ConversationStream`] yields every message after
//! its starting point exactly once, in append order.

use std::collections::{HashMap, VecDeque};

use futures::Stream;
use tracing::{debug, trace, warn};

use courier_hub::{ConversationSubscription, HubError, ParticipantSubscription, SubscriptionHub};
use courier_shared::{ConversationKey, MessageId, ParticipantId, Result};
use courier_store::{ConversationSummary, Message};

use crate::store::SharedStore;

/// Where a conversation stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resume {
    /// Only messages appended after the stream is opened.
    Head,
    /// Messages after the given message (a client-held cursor).
    After(MessageId),
    /// Messages after the given sequence number.
    AfterSeq(u64),
}

/// Live, ordered stream of one conversation's messages.
pub struct ConversationStream {
    key: ConversationKey,
    subscription: ConversationSubscription,
    store: SharedStore,
    batch: u32,
    last_seq: u64,
    last_id: Option<MessageId>,
    pending: VecDeque<Message>,
    caught_up: bool,
}

impl ConversationStream {
    pub(crate) async fn open(
        store: SharedStore,
        hub: &SubscriptionHub,
        key: ConversationKey,
        resume: Resume,
        batch: u32,
    ) -> Result<Self> {
        // Subscribe before reading the log so nothing appended in between is
        // lost; anything seen twice is dropped by sequence number.
        let subscription = hub.subscribe_conversation(&key);

        let last_seq = match resume {
            Resume::AfterSeq(seq) => seq,
            Resume::Head => {
                let k = key.clone();
                store.run("head_seq", move |db| db.head_seq(&k)).await?
            }
            Resume::After(id) => {
                let k = key.clone();
                store
                    .run("resolve_cursor", move |db| db.resolve_cursor(&k, id))
                    .await?
            }
        };

        debug!(key = %key, last_seq, ?resume, "conversation stream opened");

        Ok(Self {
            key,
            subscription,
            store,
            batch: batch.max(1),
            last_seq,
            last_id: match resume {
                Resume::After(id) => Some(id),
                _ => None,
            },
            pending: VecDeque::new(),
            caught_up: resume == Resume::Head,
        })
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Id of the last message yielded, usable as `since` when reconnecting.
    pub fn cursor(&self) -> Option<MessageId> {
        self.last_id
    }

    /// Wait for the next message. `Ok(None)` once the stream is closed.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(self.deliver(message)));
            }
            if !self.caught_up {
                self.backfill().await?;
                continue;
            }

            match self.subscription.recv().await {
                Ok(message) if message.seq <= self.last_seq => {
                    trace!(key = %self.key, seq = message.seq, "duplicate dropped");
                }
                Ok(message) if message.seq == self.last_seq + 1 => {
                    return Ok(Some(self.deliver(message)));
                }
                Ok(message) => {
                    debug!(
                        key = %self.key,
                        expected = self.last_seq + 1,
                        got = message.seq,
                        "gap in live stream, backfilling"
                    );
                    self.backfill().await?;
                    if self.pending.is_empty() {
                        self.pending.push_back(message);
                    }
                }
                Err(HubError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "conversation subscriber lagged, backfilling");
                    self.backfill().await?;
                }
                Err(HubError::Closed) => return Ok(None),
            }
        }
    }

    /// Stop the stream and release its subscription.
    pub fn release(self) {
        self.subscription.release();
    }

    /// Adapt into a [`futures::Stream`]. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn deliver(&mut self, message: Message) -> Message {
        self.last_seq = message.seq;
        self.last_id = Some(message.id);
        message
    }

    async fn backfill(&mut self) -> Result<()> {
        let key = self.key.clone();
        let after = self.last_seq;
        let batch = self.batch;
        let page = self
            .store
            .run("messages_after", move |db| db.messages_after(&key, after, batch))
            .await?;

        self.caught_up = (page.len() as u32) < batch;
        trace!(key = %self.key, after, loaded = page.len(), "backfilled");
        self.pending.extend(page);
        Ok(())
    }
}

impl std::fmt::Debug for ConversationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStream")
            .field("key", &self.key.to_string())
            .field("last_seq", &self.last_seq)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Live stream of summary changes for every conversation of a participant.
///
/// Summaries older than one already yielded for the same conversation are
/// skipped. When the subscriber lags, the participant's conversation list
/// is reloaded and anything newer is yielded again.
pub struct SummaryStream {
    participant: ParticipantId,
    subscription: ParticipantSubscription,
    store: SharedStore,
    seen: HashMap<ConversationKey, u64>,
    pending: VecDeque<ConversationSummary>,
}

impl SummaryStream {
    pub(crate) fn open(store: SharedStore, hub: &SubscriptionHub, participant: ParticipantId) -> Self {
        let subscription = hub.subscribe_participant(&participant);
        debug!(participant = %participant, "summary stream opened");
        Self {
            participant,
            subscription,
            store,
            seen: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Wait for the next summary change. `Ok(None)` once the stream is
    /// closed.
    pub async fn next(&mut self) -> Result<Option<ConversationSummary>> {
        loop {
            let summary = match self.pending.pop_front() {
                Some(summary) => summary,
                None => match self.subscription.recv().await {
                    Ok(summary) => summary,
                    Err(HubError::Lagged(skipped)) => {
                        warn!(participant = %self.participant, skipped, "summary subscriber lagged, reloading");
                        self.reload().await?;
                        continue;
                    }
                    Err(HubError::Closed) => return Ok(None),
                },
            };

            let newer = self
                .seen
                .get(&summary.key)
                .map_or(true, |&revision| summary.revision > revision);
            if newer {
                self.seen.insert(summary.key.clone(), summary.revision);
                return Ok(Some(summary));
            }
            trace!(key = %summary.key, revision = summary.revision, "stale summary dropped");
        }
    }

    pub fn release(self) {
        self.subscription.release();
    }

    /// Adapt into a [`futures::Stream`]. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ConversationSummary>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next().await {
                Ok(Some(summary)) => Some((Ok(summary), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn reload(&mut self) -> Result<()> {
        let participant = self.participant.clone();
        let list = self
            .store
            .run("list_for_participant", move |db| {
                db.list_for_participant(&participant)
            })
            .await?;
        self.pending.extend(list);
        Ok(())
    }
}

impl std::fmt::Debug for SummaryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryStream")
            .field("participant", &self.participant.to_string())
            .field("tracked", &self.seen.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use courier_shared::derive_key;
    use courier_store::{Database, NewMessage};

    use super::*;

    fn p(s: &str) -> ParticipantId {
        ParticipantId::parse(s).unwrap()
    }

    fn setup() -> (tempfile::TempDir, SharedStore, SubscriptionHub) {
        setup_with_capacity(16)
    }

    fn setup_with_capacity(capacity: usize) -> (tempfile::TempDir, SharedStore, SubscriptionHub) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, SharedStore::new(db, Duration::from_secs(5)), SubscriptionHub::new(capacity))
    }

    async fn append(store: &SharedStore, content: &str) -> Message {
        let new = NewMessage {
            conversation_key: derive_key(&p("u1"), &p("u2")).unwrap(),
            sender_id: p("u1"),
            recipient_id: p("u2"),
            content: content.to_string(),
            attachments: Vec::new(),
            idempotency_key: None,
        };
        store
            .run("append", move |db| db.append_message(&new, Utc::now()))
            .await
            .unwrap()
            .message
    }

    #[tokio::test]
    async fn out_of_order_publish_is_delivered_in_append_order() {
        let (_dir, store, hub) = setup();
        let key = derive_key(&p("u1"), &p("u2")).unwrap();
        let mut stream = ConversationStream::open(store.clone(), &hub, key, Resume::Head, 10)
            .await
            .unwrap();

        let first = append(&store, "first").await;
        let second = append(&store, "second").await;
        hub.publish_message(&second);
        hub.publish_message(&first);

        assert_eq!(stream.next().await.unwrap().unwrap().id, first.id);
        assert_eq!(stream.next().await.unwrap().unwrap().id, second.id);

        let third = append(&store, "third").await;
        hub.publish_message(&third);
        assert_eq!(stream.next().await.unwrap().unwrap().id, third.id);
        assert_eq!(stream.cursor(), Some(third.id));
    }

    #[tokio::test]
    async fn resume_catches_up_in_small_batches() {
        let (_dir, store, hub) = setup();
        let key = derive_key(&p("u1"), &p("u2")).unwrap();
        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(append(&store, &format!("m{i}")).await);
        }

        let mut stream =
            ConversationStream::open(store.clone(), &hub, key, Resume::After(sent[0].id), 2)
                .await
                .unwrap();

        for expected in &sent[1..] {
            assert_eq!(stream.next().await.unwrap().unwrap().id, expected.id);
        }
    }

    #[tokio::test]
    async fn stale_summaries_are_skipped() {
        let (_dir, store, hub) = setup();
        let mut stream = SummaryStream::open(store.clone(), &hub, p("u2"));

        append(&store, "one").await;
        append(&store, "two").await;
        let key = derive_key(&p("u1"), &p("u2")).unwrap();
        let k = key.clone();
        let latest = store.run("summary", move |db| db.get_summary(&k)).await.unwrap();
        let mut stale = latest.clone();
        stale.revision -= 1;

        hub.publish_summary(&latest);
        hub.publish_summary(&stale);
        hub.publish_summary(&latest);

        assert_eq!(stream.next().await.unwrap().unwrap().revision, latest.revision);
        assert!(matches!(
            tokio::time::timeout(Duration::from_millis(50), stream.next()).await,
            Err(_)
        ));
    }

    #[tokio::test]
    async fn lagged_conversation_stream_backfills_from_log() {
        let (_dir, store, hub) = setup_with_capacity(2);
        let key = derive_key(&p("u1"), &p("u2")).unwrap();
        let mut stream = ConversationStream::open(store.clone(), &hub, key, Resume::Head, 10)
            .await
            .unwrap();

        for i in 0..5 {
            let message = append(&store, &format!("m{i}")).await;
            hub.publish_message(&message);
        }

        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(stream.next().await.unwrap().unwrap().seq);
        }
        assert_eq!(seqs, [1, 2, 3, 4, 5]);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn lagged_summary_stream_reloads_latest_revision() {
        let (_dir, store, hub) = setup_with_capacity(2);
        let mut stream = SummaryStream::open(store.clone(), &hub, p("u2"));
        let key = derive_key(&p("u1"), &p("u2")).unwrap();

        for i in 0..3 {
            append(&store, &format!("m{i}")).await;
            let k = key.clone();
            let summary = store.run("summary", move |db| db.get_summary(&k)).await.unwrap();
            hub.publish_summary(&summary);
        }

        let reloaded = stream.next().await.unwrap().unwrap();
        assert_eq!(reloaded.revision, 3);
        assert_eq!(reloaded.unread_for(&p("u2")), 3);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn dropped_hub_ends_stream() {
        let (_dir, store, hub) = setup();
        let key = derive_key(&p("u1"), &p("u2")).unwrap();
        let mut stream = ConversationStream::open(store, &hub, key.clone(), Resume::Head, 10)
            .await
            .unwrap();
        assert_eq!(hub.conversation_subscribers(&key), 1);

        drop(hub);
        assert_eq!(stream.next().await.unwrap(), None);
    }
}
