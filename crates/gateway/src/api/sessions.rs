//! Session endpoints.
//!
//! - `GET /v1/sessions/:id/messages` - the repaired transcript
//! - `GET /v1/sessions/:id/events`   - SSE stream of the session's turn events

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use tokio::sync::broadcast;

use sb_sessions::{costs_of, messages_of};

use super::api_error;
use crate::runtime::{repair, TurnEvent};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let entries = match state.store.load(&session_id).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "failed to load session");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    if entries.is_empty() {
        return api_error(StatusCode::NOT_FOUND, format!("unknown session: {session_id}"));
    }

    let messages = repair(&messages_of(&entries));
    let mut usage = sb_domain::stream::Usage::default();
    for c in costs_of(&entries) {
        usage.add(&c.usage);
    }
    let route = state.routes.find_by_session(&session_id).map(|e| e.route);

    Json(serde_json::json!({
        "session_id": session_id,
        "route": route,
        "messages": messages,
        "usage": usage,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:id/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The stream ends when the session is compacted away.
pub async fn session_events_sse(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let rx = state.controller.subscribe(&session_id);
    Sse::new(make_session_event_stream(rx)).keep_alive(KeepAlive::default())
}

fn make_session_event_stream(
    mut rx: broadcast::Receiver<TurnEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event_name(&event)).data(data));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let msg = format!("{{\"warning\":\"missed {n} events\"}}");
                    yield Ok(Event::default().event("warning").data(msg));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn event_name(event: &TurnEvent) -> &'static str {
    match event {
        TurnEvent::AssistantDelta { .. } => "assistant.delta",
        TurnEvent::ToolCall { .. } => "tool.call",
        TurnEvent::ToolResult { .. } => "tool.result",
        TurnEvent::QueuedInjected { .. } => "input.injected",
        TurnEvent::Final { .. } => "final",
        TurnEvent::Stopped { .. } => "stopped",
        TurnEvent::Error { .. } => "error",
        TurnEvent::Usage { .. } => "usage",
        TurnEvent::Compacted { .. } => "session.compacted",
        TurnEvent::Queued { .. } => "input.queued",
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use futures_util::StreamExt;

    use sb_domain::tool::Message;
    use sb_sessions::SessionEntry;

    use super::*;
    use crate::api::test_support::*;

    #[tokio::test]
    async fn transcript_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "SB_TEST_SESSIONS_NO_TOKEN");
        let (entry, _) = state.routes.resolve_or_create("web:1");
        let sid = entry.session_id;

        let tool_use = sb_domain::tool::ContentBlock::ToolUse {
            id: "c1".into(),
            name: "exec".into(),
            input: serde_json::json!({}),
        };
        state
            .store
            .append(&sid, SessionEntry::message(Message::user_text("run it"), None))
            .await
            .unwrap();
        state
            .store
            .append(&sid, SessionEntry::message(Message::assistant(vec![tool_use]), None))
            .await
            .unwrap();

        let (status, body) = call_get(&state, &format!("/v1/sessions/{sid}/messages")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route"], "web:1");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["is_error"], true);

        let (status, _) = call_get(&state, "/v1/sessions/missing/messages").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn call_get(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        call(state, get(uri)).await
    }

    #[tokio::test]
    async fn event_stream_ends_when_channel_closes() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(TurnEvent::Final { content: "done".into() }).unwrap();
        drop(tx);

        let events: Vec<_> = make_session_event_stream(rx).collect().await;
        assert_eq!(events.len(), 1);
    }
}
