use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_service::{MessagingFacade, SendRequest};
use courier_shared::{ConversationKey, MessageId, MessagingError, ParticipantId};
use courier_store::{ConversationSummary, Message};

use crate::auth::AuthenticatedParticipant;
use crate::error::ServerError;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub facade: MessagingFacade,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/messages", post(send_message))
        .route("/conversations", get(list_conversations))
        .route("/conversations/with/:other", get(open_conversation))
        .route("/conversations/:key/messages", get(fetch_messages))
        .route("/conversations/:key/read", post(mark_read))
        .route("/conversations/:key/events", get(conversation_events))
        .route("/events", get(summary_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct SendResponse {
    id: MessageId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenConversationResponse {
    key: ConversationKey,
    summary: Option<ConversationSummary>,
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct WindowQuery {
    limit: Option<u32>,
    before: Option<MessageId>,
}

#[derive(Deserialize)]
struct EventsQuery {
    since: Option<MessageId>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn send_message(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendResponse>), ServerError> {
    if !state.rate_limiter.check(&caller.0).await {
        return Err(ServerError::RateLimited);
    }
    let id = state.facade.send(&caller.session(), request).await?;
    Ok((StatusCode::CREATED, Json(SendResponse { id })))
}

async fn list_conversations(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let list = state.facade.list_conversations(&caller.session()).await?;
    Ok(Json(list))
}

async fn open_conversation(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
    Path(other): Path<String>,
) -> Result<Json<OpenConversationResponse>, ServerError> {
    let other = ParticipantId::parse(&other)?;
    // Live updates are served by the events endpoint.
    let view = state
        .facade
        .conversation_with(&caller.session(), &other)
        .await?;

    Ok(Json(OpenConversationResponse {
        key: view.key,
        summary: view.summary,
        messages: view.window,
    }))
}

async fn fetch_messages(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
    Path(key): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let key = ConversationKey::parse(&key)?;
    let window = state
        .facade
        .fetch_window(&caller.session(), &key, query.limit, query.before)
        .await?;
    Ok(Json(window))
}

async fn mark_read(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
    Path(key): Path<String>,
) -> Result<StatusCode, ServerError> {
    let key = ConversationKey::parse(&key)?;
    state
        .facade
        .mark_conversation_read(&caller.session(), &key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// SSE stream of a conversation's messages. Reconnecting clients resume
/// from `since` or from the `Last-Event-ID` header.
async fn conversation_events(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
    Path(key): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let key = ConversationKey::parse(&key)?;
    let since = match query.since {
        Some(id) => Some(id),
        None => last_event_id(&headers)?,
    };

    let stream = state
        .facade
        .subscribe_conversation(&caller.session(), &key, since)
        .await?;
    debug!(key = %key, participant = %caller.0, ?since, "conversation events opened");

    let events = stream.into_stream().map(|item| {
        Ok(match item {
            Ok(message) => to_event("message", Some(message.id), &message),
            Err(e) => error_event(&e),
        })
    });
    Ok(Sse::new(events).keep_alive(keep_alive()))
}

/// SSE stream of summary changes for the caller's conversations.
async fn summary_events(
    State(state): State<AppState>,
    caller: AuthenticatedParticipant,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let stream = state.facade.subscribe_conversations(&caller.session())?;
    debug!(participant = %caller.0, "summary events opened");

    let events = stream.into_stream().map(|item| {
        Ok(match item {
            Ok(summary) => to_event("summary", None, &summary),
            Err(e) => error_event(&e),
        })
    });
    Ok(Sse::new(events).keep_alive(keep_alive()))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<MessageId>, ServerError> {
    let Some(value) = headers.get("last-event-id") else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<MessageId>().ok())
        .map(Some)
        .ok_or_else(|| ServerError::BadRequest("Invalid Last-Event-ID".into()))
}

fn to_event<T: Serialize>(name: &'static str, id: Option<MessageId>, payload: &T) -> Event {
    let event = Event::default().event(name);
    let event = match id {
        Some(id) => event.id(id.to_string()),
        None => event,
    };
    match event.json_data(payload) {
        Ok(event) => event,
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

fn error_event(err: &MessagingError) -> Event {
    Event::default().event("error").data(err.to_string())
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(Duration::from_secs(15))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use courier_store::Database;

    use super::*;
    use crate::auth::PARTICIPANT_HEADER;
    use crate::config::ServerConfig;

    fn app_with(rate: f64, burst: f64) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("courier.db")).unwrap();
        let state = AppState {
            facade: MessagingFacade::new(db, ServerConfig::default().service_config()),
            rate_limiter: RateLimiter::new(rate, burst),
        };
        (dir, build_router(state))
    }

    fn app() -> (tempfile::TempDir, Router) {
        app_with(10.0, 30.0)
    }

    fn request(
        method: Method,
        uri: &str,
        caller: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            builder = builder.header(PARTICIPANT_HEADER, caller);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn send_body(to: &str, content: &str) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "recipientId": to, "content": content }))
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let (status, body) = call(&app, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_send_list_read_flow() {
        let (_dir, app) = app();

        let (status, body) = call(
            &app,
            request(Method::POST, "/messages", Some("u1"), send_body("u2", "Hi")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["id"].is_string());

        let (status, body) =
            call(&app, request(Method::GET, "/conversations", Some("u2"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["key"], "u1_u2");
        assert_eq!(body[0]["unread"]["u2"], 1);
        assert_eq!(body[0]["lastMessage"], "Hi");

        let (status, body) = call(
            &app,
            request(Method::GET, "/conversations/u1_u2/messages?limit=10", Some("u2"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["content"], "Hi");
        assert_eq!(body[0]["seq"], 1);

        let (status, _) = call(
            &app,
            request(Method::POST, "/conversations/u1_u2/read", Some("u2"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) =
            call(&app, request(Method::GET, "/conversations", Some("u2"), None)).await;
        assert_eq!(body[0]["unread"]["u2"], 0);
    }

    #[tokio::test]
    async fn test_open_conversation() {
        let (_dir, app) = app();

        let (status, body) = call(
            &app,
            request(Method::GET, "/conversations/with/u2", Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "u1_u2");
        assert!(body["summary"].is_null());
        assert_eq!(body["messages"], serde_json::json!([]));

        call(
            &app,
            request(Method::POST, "/messages", Some("u2"), send_body("u1", "Hello")),
        )
        .await;
        let (_, body) = call(
            &app,
            request(Method::GET, "/conversations/with/u2", Some("u1"), None),
        )
        .await;
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["summary"]["unread"]["u1"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_dir, app) = app();

        let (status, _) = call(
            &app,
            request(Method::POST, "/messages", None, send_body("u2", "Hi")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &app,
            request(Method::POST, "/messages", Some("u1"), send_body("u1", "me")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["retryable"], false);

        let (status, _) = call(
            &app,
            request(Method::POST, "/messages", Some("u1"), send_body("u2", "   ")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            request(Method::GET, "/conversations/u1_u9/messages", Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            request(Method::GET, "/conversations/u2_u1/messages", Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            request(Method::POST, "/conversations/u1_u2/read", Some("u3"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_rate_limited() {
        let (_dir, app) = app_with(0.001, 1.0);

        let (status, _) = call(
            &app,
            request(Method::POST, "/messages", Some("u1"), send_body("u2", "one")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &app,
            request(Method::POST, "/messages", Some("u1"), send_body("u2", "two")),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = call(
            &app,
            request(Method::POST, "/messages", Some("u2"), send_body("u1", "other")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[test]
    fn test_last_event_id() {
        let mut headers = HeaderMap::new();
        assert!(last_event_id(&headers).unwrap().is_none());

        let id = MessageId::new();
        headers.insert("last-event-id", id.to_string().parse().unwrap());
        assert_eq!(last_event_id(&headers).unwrap(), Some(id));

        headers.insert("last-event-id", "garbage".parse().unwrap());
        assert!(last_event_id(&headers).is_err());
    }
}
