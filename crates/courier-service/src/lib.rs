//! # courier-service
//!
//! The messaging facade: the only entry point external collaborators use to
//! send messages, read history, list conversations, mark them read and open
//! live views.
//!
//! A send derives the conversation key, appends the message and updates the
//! conversation index in one store transaction, then fans the result out
//! through the [`SubscriptionHub`](courier_hub::SubscriptionHub). Store work
//! runs on the blocking pool under a bounded timeout; a timeout surfaces as
//! `Transient` and is safe to retry with the same idempotency key.

pub mod config;
pub mod facade;
pub mod session;
pub mod store;
pub mod stream;

pub use config::ServiceConfig;
pub use facade::{ConversationWindow, MessagingFacade, OpenConversation, SendRequest};
pub use session::Session;
pub use store::SharedStore;
pub use stream::{ConversationStream, SummaryStream};
