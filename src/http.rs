// review-bridge/src/http.rs
//
// HTTP endpoint group for agent sessions.
//
//   POST   /mcp        JSON-RPC request/notification; `initialize` without a
//                      session header mints one
//   GET    /mcp        server-push stream for an existing session
//   DELETE /mcp        explicit session close
//   GET    /sse        legacy: opens a session, first event names the
//                      `/messages` endpoint
//   POST   /messages   legacy: requests whose replies travel over the stream

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use std::{convert::Infallible, future::Future, io, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    protocol::{self, RpcError, INVALID_REQUEST, INVALID_SESSION, PARSE_ERROR},
    router::{RouterReply, SessionRouter, TransportKind},
};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const AUTH_HEADER: &str = "x-ide-authorization";

#[derive(Clone)]
struct HttpState {
    router: SessionRouter,
    auth_token: Arc<str>,
}

pub fn routes(router: SessionRouter, auth_token: impl Into<Arc<str>>) -> Router {
    let state = HttpState { router, auth_token: auth_token.into() };
    Router::new()
        .route("/mcp", post(mcp_post).get(mcp_stream).delete(mcp_delete))
        .route("/sse", get(legacy_stream))
        .route("/messages", post(legacy_message))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

async fn require_token(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    let presented = req.headers().get(AUTH_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(&*state.auth_token) {
        warn!(path = %req.uri().path(), "rejecting request without a valid auth token");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(req).await
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

fn invalid_session() -> Response {
    let body = protocol::failure(&Value::Null, &RpcError::invalid_session());
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

/// Transport status for a rejected message. Errors about the message itself
/// fail the HTTP request; errors from a method call ride on a 200.
fn rejection_status(error: &RpcError, had_session: bool) -> StatusCode {
    match error.code {
        INVALID_SESSION if had_session => StatusCode::NOT_FOUND,
        INVALID_SESSION | PARSE_ERROR | INVALID_REQUEST => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

async fn mcp_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let session = session_header(&headers);
    match state.router.handle(session, &body).await {
        RouterReply::Initialized { session_id, body } => {
            ([(SESSION_HEADER, session_id)], Json(body)).into_response()
        }
        RouterReply::Response(body) => Json(body).into_response(),
        RouterReply::Accepted => StatusCode::ACCEPTED.into_response(),
        RouterReply::Rejected { body, error } => {
            debug!(code = error.code, message = %error.message, "rejected message");
            (rejection_status(&error, session.is_some()), Json(body)).into_response()
        }
    }
}

/// Ends the session when the client drops the stream.
struct CloseOnDrop {
    router: SessionRouter,
    session_id: String,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.router.close_session(&self.session_id) {
            debug!(session = %self.session_id, "stream dropped by client");
        }
    }
}

fn push_stream(router: SessionRouter, session_id: String) -> Option<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = router.attach_stream(&session_id)?;
    let guard = CloseOnDrop { router, session_id };
    Some(ReceiverStream::new(rx).map(move |message| {
        let _guard = &guard;
        Ok(Event::default().event("message").data(message.to_string()))
    }))
}

async fn mcp_stream(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers).filter(|id| state.router.contains(id)) else {
        return invalid_session();
    };
    match push_stream(state.router.clone(), id.to_string()) {
        Some(stream) => {
            info!(session = %id, "push stream attached");
            Sse::new(stream).into_response()
        }
        None => (StatusCode::CONFLICT, "stream already attached for this session").into_response(),
    }
}

async fn mcp_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    match session_header(&headers) {
        Some(id) if state.router.close_session(id) => StatusCode::NO_CONTENT.into_response(),
        _ => invalid_session(),
    }
}

async fn legacy_stream(State(state): State<HttpState>) -> Response {
    let id = state.router.open_session(TransportKind::LegacySse);
    let Some(messages) = push_stream(state.router.clone(), id.clone()) else {
        state.router.close_session(&id);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let endpoint = Event::default().event("endpoint").data(format!("/messages?sessionId={id}"));
    let stream = tokio_stream::once(Ok(endpoint)).chain(messages);
    Sse::new(stream).into_response()
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn legacy_message(State(state): State<HttpState>, Query(q): Query<MessagesQuery>, body: Bytes) -> Response {
    if !state.router.contains(&q.session_id) {
        return invalid_session();
    }
    let reply = match state.router.handle(Some(&q.session_id), &body).await {
        RouterReply::Response(body) | RouterReply::Rejected { body, .. } | RouterReply::Initialized { body, .. } => {
            Some(body)
        }
        RouterReply::Accepted => None,
    };
    if let Some(body) = reply
        && !state.router.push(&q.session_id, body)
    {
        return invalid_session();
    }
    StatusCode::ACCEPTED.into_response()
}
