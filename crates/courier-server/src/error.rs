use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::MessagingError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Too many messages, slow down")]
    RateLimited,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Messaging(e) => match e {
                MessagingError::InvalidConversation(_) | MessagingError::InvalidContent(_) => {
                    StatusCode::BAD_REQUEST
                }
                MessagingError::Unauthenticated => StatusCode::UNAUTHORIZED,
                MessagingError::NotFound(_) => StatusCode::NOT_FOUND,
                MessagingError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                MessagingError::Conflict(_) => StatusCode::CONFLICT,
                MessagingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Messaging(MessagingError::Storage(_)) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };
        let retryable = matches!(&self, ServerError::Messaging(e) if e.is_retryable());

        let body = serde_json::json!({
            "error": message,
            "retryable": retryable,
        });

        (status, axum::Json(body)).into_response()
    }
}
