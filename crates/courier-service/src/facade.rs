//! The messaging facade.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use courier_hub::SubscriptionHub;
use courier_shared::constants::{MAX_ATTACHMENTS, MAX_ATTACHMENT_REF_LEN, MAX_CONTENT_BYTES};
use courier_shared::{
    derive_key, ConversationKey, IdempotencyKey, MessageId, MessagingError, ParticipantId, Result,
};
use courier_store::{AppendOutcome, ConversationSummary, Database, Message, NewMessage};

use crate::config::ServiceConfig;
use crate::session::Session;
use crate::store::SharedStore;
use crate::stream::{ConversationStream, Resume, SummaryStream};

/// A message to send on behalf of the session's participant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub recipient_id: ParticipantId,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SendRequest {
    pub fn new(recipient_id: ParticipantId, content: impl Into<String>) -> Self {
        Self {
            recipient_id,
            content: content.into(),
            attachments: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// Latest state of a thread, without a live view.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    pub key: ConversationKey,
    /// `None` until the first message is sent.
    pub summary: Option<ConversationSummary>,
    pub window: Vec<Message>,
}

/// An opened thread: the latest history window plus a live stream that
/// continues right after it.
#[derive(Debug)]
pub struct OpenConversation {
    pub key: ConversationKey,
    /// `None` until the first message is sent.
    pub summary: Option<ConversationSummary>,
    pub window: Vec<Message>,
    pub stream: ConversationStream,
}

/// Entry point for sending, reading and watching conversations.
///
/// Cheap to clone; clones share the store handle and the hub.
#[derive(Clone)]
pub struct MessagingFacade {
    store: SharedStore,
    hub: SubscriptionHub,
    config: ServiceConfig,
}

impl MessagingFacade {
    pub fn new(db: Database, config: ServiceConfig) -> Self {
        Self {
            store: SharedStore::new(db, config.store_timeout),
            hub: SubscriptionHub::new(config.channel_capacity),
            config,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Append a message from the session's participant to `recipient_id`
    /// and fan it out.
    ///
    /// Retrying with the same idempotency key after a `Transient` failure
    /// returns the id of the message that was stored, if any was.
    pub async fn send(&self, session: &Session, request: SendRequest) -> Result<MessageId> {
        let sender = session.participant()?.clone();
        let key = derive_key(&sender, &request.recipient_id)?;
        validate_content(&request.content, &request.attachments)?;

        let new = NewMessage {
            conversation_key: key,
            sender_id: sender,
            recipient_id: request.recipient_id,
            content: request.content,
            attachments: request.attachments,
            idempotency_key: request.idempotency_key,
        };
        // Publishing is tied to the commit, not to this call: a send that
        // times out but commits later still reaches live viewers.
        // Duplicates are published again so a subscriber that missed the
        // original delivery still gets it; resync streams drop repeats.
        let hub = self.hub.clone();
        let outcome = self
            .store
            .run_then(
                "append_message",
                move |db| db.append_message(&new, Utc::now()),
                move |outcome: &AppendOutcome| {
                    let viewers = hub.publish_message(&outcome.message);
                    hub.publish_summary(&outcome.summary);
                    debug!(
                        key = %outcome.message.conversation_key,
                        seq = outcome.message.seq,
                        viewers,
                        "message published"
                    );
                },
            )
            .await?;

        let message = &outcome.message;
        info!(
            key = %message.conversation_key,
            seq = message.seq,
            id = %message.id,
            sender = %message.sender_id,
            duplicate = outcome.duplicate,
            "message sent"
        );
        Ok(message.id)
    }

    /// Reset the caller's unread counter for `key`. A no-op when nothing is
    /// unread.
    pub async fn mark_conversation_read(&self, session: &Session, key: &ConversationKey) -> Result<()> {
        let reader = member_of(session, key)?.clone();
        let k = key.clone();
        let hub = self.hub.clone();
        let changed = self
            .store
            .run_then(
                "mark_read",
                move |db| db.mark_read(&k, &reader),
                move |changed: &Option<ConversationSummary>| {
                    if let Some(summary) = changed {
                        hub.publish_summary(summary);
                    }
                },
            )
            .await?;

        match changed {
            Some(summary) => {
                debug!(key = %key, revision = summary.revision, "conversation read");
            }
            None => debug!(key = %key, "conversation already read"),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The caller's conversations, most recently active first.
    pub async fn list_conversations(&self, session: &Session) -> Result<Vec<ConversationSummary>> {
        let participant = session.participant()?.clone();
        self.store
            .run("list_for_participant", move |db| {
                db.list_for_participant(&participant)
            })
            .await
    }

    /// A page of history, oldest first. `before` pages backward from a
    /// message id; `limit` defaults to the configured page size.
    pub async fn fetch_window(
        &self,
        session: &Session,
        key: &ConversationKey,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        member_of(session, key)?;
        let limit = limit.unwrap_or(self.config.default_page_size);
        let k = key.clone();
        self.store
            .run("fetch_window", move |db| db.fetch_window(&k, limit, before))
            .await
    }

    // ------------------------------------------------------------------
    // Live views
    // ------------------------------------------------------------------

    /// The thread with `other` as it stands: its key, summary and latest
    /// window. A conversation that does not exist yet yields no summary and
    /// an empty window.
    pub async fn conversation_with(
        &self,
        session: &Session,
        other: &ParticipantId,
    ) -> Result<ConversationWindow> {
        let me = session.participant()?;
        let key = derive_key(me, other)?;

        let k = key.clone();
        let limit = self.config.default_page_size;
        let loaded = self
            .store
            .run("conversation_with", move |db| {
                let summary = db.get_summary(&k)?;
                let window = db.fetch_window(&k, limit, None)?;
                Ok((summary, window))
            })
            .await;

        let (summary, window) = match loaded {
            Ok((summary, window)) => (Some(summary), window),
            Err(MessagingError::NotFound(_)) => (None, Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(ConversationWindow {
            key,
            summary,
            window,
        })
    }

    /// Open the thread with `other`: its summary, the latest window and a
    /// stream of everything after it.
    ///
    /// With `since`, the stream starts after that message instead. A
    /// conversation that does not exist yet opens with an empty window and
    /// a stream that yields its first message. Opening does not mark
    /// anything read.
    pub async fn open_conversation(
        &self,
        session: &Session,
        other: &ParticipantId,
        since: Option<MessageId>,
    ) -> Result<OpenConversation> {
        let ConversationWindow {
            key,
            summary,
            window,
        } = self.conversation_with(session, other).await?;

        let resume = match (since, window.last()) {
            (Some(id), _) => Resume::After(id),
            (None, Some(last)) => Resume::AfterSeq(last.seq),
            (None, None) => Resume::AfterSeq(0),
        };
        let stream = ConversationStream::open(
            self.store.clone(),
            &self.hub,
            key.clone(),
            resume,
            self.config.resync_batch,
        )
        .await?;

        debug!(key = %key, window = window.len(), "conversation opened");
        Ok(OpenConversation {
            key,
            summary,
            window,
            stream,
        })
    }

    /// Live messages of `key`. With `since`, every message after that one
    /// is delivered first.
    pub async fn subscribe_conversation(
        &self,
        session: &Session,
        key: &ConversationKey,
        since: Option<MessageId>,
    ) -> Result<ConversationStream> {
        member_of(session, key)?;
        let resume = since.map_or(Resume::Head, Resume::After);
        ConversationStream::open(
            self.store.clone(),
            &self.hub,
            key.clone(),
            resume,
            self.config.resync_batch,
        )
        .await
    }

    /// Live summary changes for every conversation of the caller.
    pub fn subscribe_conversations(&self, session: &Session) -> Result<SummaryStream> {
        let participant = session.participant()?.clone();
        Ok(SummaryStream::open(self.store.clone(), &self.hub, participant))
    }
}

impl std::fmt::Debug for MessagingFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingFacade")
            .field("hub", &self.hub)
            .field("config", &self.config)
            .finish()
    }
}

fn member_of<'a>(session: &'a Session, key: &ConversationKey) -> Result<&'a ParticipantId> {
    let participant = session.participant()?;
    if !key.contains(participant) {
        return Err(MessagingError::InvalidConversation(format!(
            "{participant} is not a participant of {key}"
        )));
    }
    Ok(participant)
}

fn validate_content(content: &str, attachments: &[String]) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MessagingError::InvalidContent("content is empty".into()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(MessagingError::InvalidContent(format!(
            "content is {} bytes, limit is {MAX_CONTENT_BYTES}",
            content.len()
        )));
    }
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(MessagingError::InvalidContent(format!(
            "{} attachments, limit is {MAX_ATTACHMENTS}",
            attachments.len()
        )));
    }
    for attachment in attachments {
        if attachment.trim().is_empty() || attachment.len() > MAX_ATTACHMENT_REF_LEN {
            return Err(MessagingError::InvalidContent(
                "attachment reference is empty or too long".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn p(s: &str) -> ParticipantId {
        ParticipantId::parse(s).unwrap()
    }

    fn session(s: &str) -> Session {
        Session::authenticated(p(s))
    }

    fn facade_with(config: ServiceConfig) -> (tempfile::TempDir, MessagingFacade) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("courier.db")).unwrap();
        (dir, MessagingFacade::new(db, config))
    }

    fn facade() -> (tempfile::TempDir, MessagingFacade) {
        facade_with(ServiceConfig::default())
    }

    fn key(a: &str, b: &str) -> ConversationKey {
        derive_key(&p(a), &p(b)).unwrap()
    }

    async fn summary(facade: &MessagingFacade, k: &ConversationKey) -> ConversationSummary {
        let k = k.clone();
        facade
            .store()
            .run("summary", move |db| db.get_summary(&k))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_send_creates_conversation_with_recipient_unread() {
        let (_dir, facade) = facade();
        facade
            .send(&session("u1"), SendRequest::new(p("u2"), "Hi"))
            .await
            .unwrap();

        let k = key("u1", "u2");
        assert_eq!(k.to_string(), "u1_u2");
        let s = summary(&facade, &k).await;
        assert_eq!(s.unread_for(&p("u2")), 1);
        assert_eq!(s.unread_for(&p("u1")), 0);
        assert_eq!(s.last_message, "Hi");
    }

    #[tokio::test]
    async fn reply_is_ordered_and_counted() {
        let (_dir, facade) = facade();
        facade
            .send(&session("u1"), SendRequest::new(p("u2"), "Hi"))
            .await
            .unwrap();
        facade
            .send(&session("u2"), SendRequest::new(p("u1"), "Hello"))
            .await
            .unwrap();

        let k = key("u1", "u2");
        let window = facade
            .fetch_window(&session("u1"), &k, Some(50), None)
            .await
            .unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["Hi", "Hello"]);
        assert!(window[0].created_at <= window[1].created_at);

        let s = summary(&facade, &k).await;
        assert_eq!(s.unread_for(&p("u1")), 1);
        assert_eq!(s.unread_for(&p("u2")), 1);
    }

    #[tokio::test]
    async fn mark_read_resets_counter_and_repeats_as_noop() {
        let (_dir, facade) = facade();
        facade
            .send(&session("u1"), SendRequest::new(p("u2"), "Hi"))
            .await
            .unwrap();
        facade
            .send(&session("u2"), SendRequest::new(p("u1"), "Hello"))
            .await
            .unwrap();

        let k = key("u1", "u2");
        facade.mark_conversation_read(&session("u1"), &k).await.unwrap();
        let after_first = summary(&facade, &k).await;
        assert_eq!(after_first.unread_for(&p("u1")), 0);
        assert_eq!(after_first.unread_for(&p("u2")), 1);

        facade.mark_conversation_read(&session("u1"), &k).await.unwrap();
        let after_second = summary(&facade, &k).await;
        assert_eq!(after_second, after_first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simultaneous_first_messages_share_one_conversation() {
        let (_dir, facade) = facade();
        let (u1, u2) = (session("u1"), session("u2"));
        let (a, b) = tokio::join!(
            facade.send(&u1, SendRequest::new(p("u2"), "from u1")),
            facade.send(&u2, SendRequest::new(p("u1"), "from u2")),
        );
        a.unwrap();
        b.unwrap();

        let list = facade.list_conversations(&session("u1")).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].key.to_string(), "u1_u2");

        let window = facade
            .fetch_window(&session("u2"), &list[0].key, None, None)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(list[0].unread_for(&p("u1")), 1);
        assert_eq!(list[0].unread_for(&p("u2")), 1);
    }

    #[tokio::test]
    async fn retry_after_transient_failure_stores_one_message() {
        let (_dir, facade) = facade_with(ServiceConfig {
            store_timeout: Duration::from_millis(250),
            ..ServiceConfig::default()
        });
        let request = SendRequest::new(p("u2"), "Hi")
            .with_idempotency_key(IdempotencyKey::parse("send-1").unwrap());

        let handle = facade.store().handle();
        let guard = handle.lock().unwrap();
        let first = facade.send(&session("u1"), request.clone()).await;
        drop(guard);
        assert!(matches!(first, Err(MessagingError::Transient(_))));
        assert!(first.unwrap_err().is_retryable());

        let id = facade.send(&session("u1"), request).await.unwrap();

        let window = facade
            .fetch_window(&session("u1"), &key("u1", "u2"), None, None)
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, id);
    }

    #[tokio::test]
    async fn send_that_commits_after_timeout_still_reaches_viewers() {
        let (_dir, facade) = facade_with(ServiceConfig {
            store_timeout: Duration::from_millis(100),
            ..ServiceConfig::default()
        });
        let u1 = session("u1");
        let u2 = session("u2");
        facade.send(&u1, SendRequest::new(p("u2"), "warmup")).await.unwrap();

        let k = key("u1", "u2");
        let mut thread = facade.subscribe_conversation(&u2, &k, None).await.unwrap();
        let mut summaries = facade.subscribe_conversations(&u2).unwrap();

        let handle = facade.store().handle();
        let guard = handle.lock().unwrap();
        let result = facade.send(&u1, SendRequest::new(p("u2"), "late")).await;
        drop(guard);
        assert!(matches!(result, Err(MessagingError::Transient(_))));

        let live = tokio::time::timeout(Duration::from_secs(2), thread.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(live.content, "late");
        assert_eq!(live.seq, 2);

        let summary = tokio::time::timeout(Duration::from_secs(2), summaries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.last_message_seq, 2);
        assert_eq!(summary.unread_for(&p("u2")), 2);
    }

    #[tokio::test]
    async fn conversation_with_reads_without_subscribing() {
        let (_dir, facade) = facade();
        let u1 = session("u1");

        let empty = facade.conversation_with(&u1, &p("u2")).await.unwrap();
        assert_eq!(empty.key, key("u1", "u2"));
        assert!(empty.summary.is_none());
        assert!(empty.window.is_empty());

        facade.send(&u1, SendRequest::new(p("u2"), "Hi")).await.unwrap();
        let view = facade.conversation_with(&session("u2"), &p("u1")).await.unwrap();
        assert_eq!(view.window.len(), 1);
        assert_eq!(view.summary.map(|s| s.last_message_seq), Some(1));
        assert_eq!(facade.hub().conversation_subscribers(&view.key), 0);
    }

    #[tokio::test]
    async fn resumed_subscriber_sees_every_later_message_once() {
        let (_dir, facade) = facade();
        let u1 = session("u1");
        let mut ids = Vec::new();
        for text in ["a", "b", "c"] {
            ids.push(facade.send(&u1, SendRequest::new(p("u2"), text)).await.unwrap());
        }

        let k = key("u1", "u2");
        let mut stream = facade
            .subscribe_conversation(&session("u2"), &k, Some(ids[0]))
            .await
            .unwrap();

        let request = SendRequest::new(p("u2"), "d")
            .with_idempotency_key(IdempotencyKey::parse("d-1").unwrap());
        let d = facade.send(&u1, request.clone()).await.unwrap();
        // Re-published duplicate must not reach the stream twice.
        assert_eq!(facade.send(&u1, request).await.unwrap(), d);
        let e = facade.send(&u1, SendRequest::new(p("u2"), "e")).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(stream.next().await.unwrap().unwrap().id);
        }
        assert_eq!(received, vec![ids[1], ids[2], d, e]);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn open_conversation_streams_after_window() {
        let (_dir, facade) = facade();
        let u1 = session("u1");

        let mut empty = facade.open_conversation(&u1, &p("u2"), None).await.unwrap();
        assert!(empty.summary.is_none());
        assert!(empty.window.is_empty());

        let first = facade.send(&u1, SendRequest::new(p("u2"), "Hi")).await.unwrap();
        assert_eq!(empty.stream.next().await.unwrap().unwrap().id, first);

        let mut opened = facade
            .open_conversation(&session("u2"), &p("u1"), None)
            .await
            .unwrap();
        assert_eq!(opened.key, key("u1", "u2"));
        assert_eq!(opened.window.len(), 1);
        assert_eq!(opened.summary.as_ref().map(|s| s.unread_for(&p("u2"))), Some(1));

        let second = facade.send(&u1, SendRequest::new(p("u2"), "again")).await.unwrap();
        assert_eq!(opened.stream.next().await.unwrap().unwrap().id, second);
        assert_eq!(opened.stream.cursor(), Some(second));
    }

    #[tokio::test]
    async fn summary_stream_follows_sends_and_reads() {
        let (_dir, facade) = facade();
        let mut summaries = facade.subscribe_conversations(&session("u2")).unwrap();

        facade
            .send(&session("u1"), SendRequest::new(p("u2"), "Hi"))
            .await
            .unwrap();
        let created = summaries.next().await.unwrap().unwrap();
        assert_eq!(created.unread_for(&p("u2")), 1);

        facade
            .mark_conversation_read(&session("u2"), &created.key)
            .await
            .unwrap();
        let read = summaries.next().await.unwrap().unwrap();
        assert_eq!(read.unread_for(&p("u2")), 0);
        assert!(read.revision > created.revision);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_writing() {
        let (_dir, facade) = facade();
        let u1 = session("u1");

        assert_eq!(
            facade
                .send(&Session::anonymous(), SendRequest::new(p("u2"), "Hi"))
                .await,
            Err(MessagingError::Unauthenticated)
        );
        assert!(matches!(
            facade.send(&u1, SendRequest::new(p("u1"), "me")).await,
            Err(MessagingError::InvalidConversation(_))
        ));
        assert!(matches!(
            facade.send(&u1, SendRequest::new(p("u2"), "  ")).await,
            Err(MessagingError::InvalidContent(_))
        ));
        let too_many = SendRequest::new(p("u2"), "pics")
            .with_attachments(vec!["ref".to_string(); MAX_ATTACHMENTS + 1]);
        assert!(matches!(
            facade.send(&u1, too_many).await,
            Err(MessagingError::InvalidContent(_))
        ));
        assert!(matches!(
            facade
                .send(&u1, SendRequest::new(p("u2"), "x".repeat(MAX_CONTENT_BYTES + 1)))
                .await,
            Err(MessagingError::InvalidContent(_))
        ));

        assert!(facade.list_conversations(&u1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_require_membership_and_an_existing_conversation() {
        let (_dir, facade) = facade();
        facade
            .send(&session("u1"), SendRequest::new(p("u2"), "Hi"))
            .await
            .unwrap();

        let k = key("u1", "u2");
        assert!(matches!(
            facade.fetch_window(&session("u3"), &k, None, None).await,
            Err(MessagingError::InvalidConversation(_))
        ));
        assert!(matches!(
            facade.mark_conversation_read(&session("u3"), &k).await,
            Err(MessagingError::InvalidConversation(_))
        ));

        let unknown = key("u1", "u9");
        assert!(matches!(
            facade.fetch_window(&session("u1"), &unknown, None, None).await,
            Err(MessagingError::NotFound(_))
        ));
        assert!(matches!(
            facade.mark_conversation_read(&session("u1"), &unknown).await,
            Err(MessagingError::NotFound(_))
        ));
    }

    #[test]
    fn send_request_reads_camel_case_json() {
        let request: SendRequest = serde_json::from_str(
            r#"{"recipientId":"u2","content":"Hi","idempotencyKey":"k-1"}"#,
        )
        .unwrap();
        assert_eq!(request.recipient_id, p("u2"));
        assert!(request.attachments.is_empty());
        assert_eq!(request.idempotency_key.unwrap().as_str(), "k-1");
    }
}
