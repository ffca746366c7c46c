//! Axum HTTP handlers for the bridge endpoints
//!
//! `GET /sse` opens a session and streams replies back to it; `POST
//! /messages` ingests one JSON-RPC request and returns 202 before the child
//! has answered. The HTTP transaction never waits for the RPC result.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::registry::{PendingEntry, SessionRegistry};
use crate::rpc::RequestId;
use crate::AppState;

const SESSION_CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subprocess: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        subprocess: if state.sink.is_alive() {
            "running"
        } else {
            "exited"
        },
    })
}

/// Deregisters the session when its SSE stream is dropped, whether the
/// client disconnected or the server cancelled the connection.
struct SessionGuard {
    sessions: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        info!(session_id = %self.session_id, "sse session closed");
    }
}

/// Emits the `endpoint` event first, then every reply line as a `message`
/// event. Ends when the outbound channel closes.
struct SessionStream {
    endpoint: Option<Event>,
    replies: ReceiverStream<String>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.endpoint.take() {
            return Poll::Ready(Some(Ok(event)));
        }
        match Pin::new(&mut this.replies).poll_next(cx) {
            Poll::Ready(Some(payload)) => {
                Poll::Ready(Some(Ok(Event::default().event("message").data(payload))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub async fn sse(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    state.sessions.insert(&session_id, tx);
    info!(session_id = %session_id, "sse session opened");

    let submit_path = format!("/messages?session_id={session_id}");
    let stream = SessionStream {
        endpoint: Some(Event::default().event("endpoint").data(submit_path)),
        replies: ReceiverStream::new(rx),
        _guard: SessionGuard {
            sessions: Arc::clone(&state.sessions),
            session_id,
        },
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(
        KEEP_ALIVE_SECS,
    )))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let session_id = query
        .session_id
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::bad_request("missing_session_id", "session_id query parameter is required")
        })?;

    let reply_tx = state.sessions.sender_for(&session_id).ok_or_else(|| {
        AppError::bad_request("unknown_session", format!("no session {session_id}"))
    })?;

    let mut frame: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request("invalid_json", format!("invalid body: {err}")))?;
    let object = frame.as_object_mut().ok_or_else(|| {
        AppError::bad_request("invalid_request", "body must be a JSON object")
    })?;

    // Registration happens before writing to the child: the reply could
    // otherwise race ahead of the routing entry and be dropped. Generated
    // ids are minted and inserted under one registry lock.
    let id: RequestId = match object.get("id") {
        Some(value) => {
            let id: RequestId = serde_json::from_value(value.clone()).map_err(|_| {
                AppError::bad_request("invalid_id", "id must be a string or a number")
            })?;
            state
                .pending
                .register(id.clone(), PendingEntry::new(&session_id, reply_tx))?;
            id
        }
        None => {
            let generated = state
                .pending
                .register_generated(PendingEntry::new(&session_id, reply_tx));
            object.insert("id".to_string(), generated.to_value());
            generated
        }
    };

    if let Err(err) = state.sink.submit(&frame).await {
        state.pending.take(&id);
        return Err(err);
    }

    Ok(StatusCode::ACCEPTED)
}
