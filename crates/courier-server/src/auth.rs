//! Caller identity for HTTP requests.
//!
//! Credentials are verified by the gateway in front of this server, which
//! forwards the resolved account id in `x-participant-id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use courier_service::Session;
use courier_shared::{MessagingError, ParticipantId};

use crate::error::ServerError;

pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// The participant a request is made on behalf of.
#[derive(Debug, Clone)]
pub struct AuthenticatedParticipant(pub ParticipantId);

impl AuthenticatedParticipant {
    pub fn session(&self) -> Session {
        Session::authenticated(self.0.clone())
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedParticipant
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let participant = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ParticipantId::parse(v.trim()).ok())
            .ok_or(MessagingError::Unauthenticated)?;
        Ok(Self(participant))
    }
}
