use crate::domain::{ConversationMessage, ListQuery, SessionInfoUpdate, SortKey, SortOrder};
use crate::infra::fetch_conversation;
use crate::server::AppState;
use crate::server::broadcast::{StreamClient, StreamFrame};
use crate::server::error::ApiError;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub project_path: Option<String>,
    pub archived: Option<bool>,
    pub pinned: Option<bool>,
    pub has_continuation: Option<bool>,
    pub sort_by: Option<SortKey>,
    pub order: Option<SortOrder>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListParams {
    fn into_query(self) -> ListQuery {
        ListQuery {
            project_path: self.project_path,
            archived: self.archived,
            pinned: self.pinned,
            has_continuation: self.has_continuation,
            sort_by: self.sort_by.unwrap_or_default(),
            order: self.order.unwrap_or_default(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// List view: one store query, no session file is ever opened here.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let (conversations, total) = state
        .store
        .list(&params.into_query())
        .map_err(|error| ApiError::HistoryReadFailed(error.to_string()))?;
    Ok(Json(json!({
        "conversations": conversations,
        "total": total,
    })))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let messages: Vec<ConversationMessage> =
        fetch_conversation(&state.store, &state.projects_dir, &session_id)?;
    Ok(Json(json!({ "messages": messages })))
}

/// Store-only metadata read; `null` when the session is unknown.
pub async fn get_conversation_metadata(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get(&session_id)
        .map_err(|error| ApiError::HistoryReadFailed(error.to_string()))?;
    let Some(record) = record else {
        return Ok(Json(Value::Null));
    };
    Ok(Json(json!({
        "summary": record.summary,
        "projectPath": record.project_path,
        "model": record.model,
        "totalDurationMs": record.total_duration_ms,
    })))
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(update): Json<SessionInfoUpdate>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .upsert_user_fields(&session_id, &update)
        .map_err(|error| ApiError::SessionUpdateFailed(error.to_string()))?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .store
        .delete(&session_id)
        .map_err(|error| ApiError::SessionUpdateFailed(error.to_string()))?;
    if !deleted {
        return Err(ApiError::ConversationNotFound(session_id));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn archive_all_sessions(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let archived = state
        .store
        .archive_all()
        .map_err(|error| ApiError::SessionUpdateFailed(error.to_string()))?;
    Ok(Json(json!({ "archived": archived })))
}

pub async fn system_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .store
        .stats()
        .map_err(|error| ApiError::HistoryReadFailed(error.to_string()))?;
    Ok(Json(serde_json::to_value(stats).unwrap_or(Value::Null)))
}

/// Long-lived event stream. The id is either a concrete channel (a session's
/// `session-<id>`, a UI's own id) or the literal `"global"` namespace.
pub async fn stream(
    State(state): State<AppState>,
    Path(streaming_id): Path<String>,
) -> impl IntoResponse {
    let client = state.broadcaster.add_client(&streaming_id);
    let guard = DetachOnDrop {
        state: state.clone(),
        streaming_id,
        conn_id: client.conn_id,
    };
    let stream = ClientEventStream {
        client,
        _guard: guard,
    };

    // Heartbeats come from the hub, so no axum keep-alive here.
    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    (headers, Sse::new(stream))
}

struct DetachOnDrop {
    state: AppState,
    streaming_id: String,
    conn_id: uuid::Uuid,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.state
            .broadcaster
            .remove_client(&self.streaming_id, self.conn_id);
    }
}

/// Adapts a hub sink into an SSE stream and detaches it from the hub when
/// the client goes away.
struct ClientEventStream {
    client: StreamClient,
    _guard: DetachOnDrop,
}

impl Stream for ClientEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.client.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame_to_event(frame)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn frame_to_event(frame: StreamFrame) -> Event {
    match frame {
        StreamFrame::Event(event) => Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event")),
        StreamFrame::Heartbeat => Event::default().comment("heartbeat"),
    }
}
