use thiserror::Error;

/// Errors observed by a subscriber while receiving.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The subscriber fell behind and that many updates were dropped from its
    /// buffer. The subscription stays usable; callers resync from the store.
    #[error("Subscriber lagged, {0} updates skipped")]
    Lagged(u64),

    /// The subscription was released or the hub shut down.
    #[error("Subscription closed")]
    Closed,
}
