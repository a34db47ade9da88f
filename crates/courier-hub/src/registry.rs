//! Keyed broadcast topics with explicit subscriber bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::HubError;

/// Identifies one live subscription within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Topic<T> {
    sender: broadcast::Sender<T>,
    subscribers: HashSet<SubscriptionId>,
}

/// A set of broadcast topics keyed by `K`. A topic exists exactly as long
/// as it has at least one subscriber.
pub(crate) struct Registry<K, T> {
    kind: &'static str,
    capacity: usize,
    next_id: Arc<AtomicU64>,
    topics: Mutex<HashMap<K, Topic<T>>>,
}

impl<K, T> Registry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub(crate) fn new(kind: &'static str, capacity: usize, next_id: Arc<AtomicU64>) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            next_id,
            topics: Mutex::new(HashMap::new()),
        }
    }

    // The lock only guards map bookkeeping and is never held across an
    // await, so a poisoned guard still holds consistent data.
    fn topics(&self) -> MutexGuard<'_, HashMap<K, Topic<T>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(self: &Arc<Self>, key: &K) -> Subscription<K, T> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let receiver = {
            let mut topics = self.topics();
            let topic = topics.entry(key.clone()).or_insert_with(|| Topic {
                sender: broadcast::channel(self.capacity).0,
                subscribers: HashSet::new(),
            });
            topic.subscribers.insert(id);
            topic.sender.subscribe()
        };

        debug!(kind = self.kind, key = %key, subscription = %id, "subscribed");

        Subscription {
            id,
            key: key.clone(),
            receiver: Some(receiver),
            registry: Arc::downgrade(self),
        }
    }

    /// Send `value` to every current subscriber of `key`. Returns how many
    /// receivers it was queued for.
    pub(crate) fn publish(&self, key: &K, value: T) -> usize {
        let topics = self.topics();
        match topics.get(key) {
            Some(topic) => topic.sender.send(value).unwrap_or(0),
            None => 0,
        }
    }

    fn release(&self, key: &K, id: SubscriptionId) {
        let mut topics = self.topics();
        let now_empty = match topics.get_mut(key) {
            Some(topic) => {
                topic.subscribers.remove(&id);
                topic.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            topics.remove(key);
        }
        drop(topics);

        debug!(
            kind = self.kind,
            key = %key,
            subscription = %id,
            topic_reclaimed = now_empty,
            "subscription released"
        );
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics().len()
    }

    pub(crate) fn subscriber_count(&self, key: &K) -> usize {
        self.topics()
            .get(key)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }
}

/// A live, caller-owned delivery channel.
///
/// Delivery stops as soon as the subscription is released, either through
/// [`Subscription::release`] or by dropping it.
pub struct Subscription<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    id: SubscriptionId,
    key: K,
    receiver: Option<broadcast::Receiver<T>>,
    registry: Weak<Registry<K, T>>,
}

impl<K, T> Subscription<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.receiver.is_none()
    }

    /// Wait for the next update.
    pub async fn recv(&mut self) -> Result<T, HubError> {
        let receiver = self.receiver.as_mut().ok_or(HubError::Closed)?;
        match receiver.recv().await {
            Ok(value) => Ok(value),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(HubError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(HubError::Closed),
        }
    }

    /// Take an already-queued update without waiting.
    pub fn try_recv(&mut self) -> Result<Option<T>, HubError> {
        let receiver = self.receiver.as_mut().ok_or(HubError::Closed)?;
        match receiver.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(HubError::Lagged(skipped)),
            Err(broadcast::error::TryRecvError::Closed) => Err(HubError::Closed),
        }
    }

    /// Stop delivery and reclaim resources now.
    pub fn release(mut self) {
        self.release_in_place();
    }

    fn release_in_place(&mut self) {
        if self.receiver.take().is_none() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, self.id);
        }
    }
}

impl<K, T> Drop for Subscription<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn drop(&mut self) {
        self.release_in_place();
    }
}

impl<K, T> fmt::Debug for Subscription<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("released", &self.is_released())
            .finish()
    }
}
