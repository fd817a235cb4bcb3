//! Route endpoints: submitting input, stopping, compaction and listing.
//!
//! - `GET  /v1/routes`                  - every known route with its live status
//! - `GET  /v1/routes/:route`           - one route
//! - `POST /v1/routes/:route/messages`  - start or queue a turn
//! - `POST /v1/routes/:route/stop`      - abort the running turn
//! - `POST /v1/routes/:route/compact`   - compact the route's session now

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use sb_domain::tool::ContentBlock;
use sb_sessions::RouteEntry;

use super::api_error;
use crate::runtime::{CompactOutcome, RouteStatus};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Text, base64 images, or raw `content` blocks, in that order.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageInput>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct ImageInput {
    pub media_type: String,
    pub data: String,
}

impl SubmitRequest {
    pub(crate) fn into_blocks(self) -> Vec<ContentBlock> {
        let mut blocks = Vec::with_capacity(self.content.len() + self.images.len() + 1);
        if let Some(text) = self.text.filter(|t| !t.trim().is_empty()) {
            blocks.push(ContentBlock::text(text));
        }
        blocks.extend(
            self.images
                .into_iter()
                .map(|img| ContentBlock::image_base64(img.media_type, img.data)),
        );
        blocks.extend(self.content);
        blocks
    }
}

fn route_json(entry: Option<&RouteEntry>, status: &RouteStatus) -> serde_json::Value {
    let mut value = serde_json::to_value(status).unwrap_or_default();
    if let (Some(entry), Some(obj)) = (entry, value.as_object_mut()) {
        obj.insert("session_id".into(), entry.session_id.clone().into());
        obj.insert("created_at".into(), entry.created_at.to_rfc3339().into());
        obj.insert("updated_at".into(), entry.updated_at.to_rfc3339().into());
        obj.insert(
            "cost".into(),
            serde_json::to_value(&entry.cost).unwrap_or_default(),
        );
    }
    value
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_routes(State(state): State<AppState>) -> impl IntoResponse {
    let controller = &state.controller;
    let routes: Vec<_> = state
        .routes
        .list()
        .iter()
        .map(|entry| route_json(Some(entry), &controller.status(&entry.route)))
        .collect();
    Json(serde_json::json!({ "routes": routes, "count": routes.len() }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/routes/:route
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_route(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    match state.routes.get(&route) {
        Some(entry) => {
            Json(route_json(Some(&entry), &state.controller.status(&route))).into_response()
        }
        None => api_error(StatusCode::NOT_FOUND, format!("unknown route: {route}")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/routes/:route/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accepts the message and returns immediately; events flow to the
/// session's SSE stream and any attached WebSocket.
pub async fn submit_message(
    State(state): State<AppState>,
    Path(route): Path<String>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    if state.llm.is_empty() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no LLM providers are configured",
        );
    }
    let content = body.into_blocks();
    if content.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "message has no content");
    }

    let outcome = state.controller.submit(&route, content, None);
    let mut body = serde_json::to_value(outcome).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("route".into(), route.into());
    }
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/routes/:route/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop_route(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    let stopped = state.controller.stop(&route);
    Json(serde_json::json!({ "route": route, "stopped": stopped }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/routes/:route/compact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn compact_route(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> impl IntoResponse {
    if state.routes.get(&route).is_none() {
        return api_error(StatusCode::NOT_FOUND, format!("unknown route: {route}"));
    }

    match state.controller.compact_now(&route).await {
        Ok(CompactOutcome::Compacted(report)) => Json(serde_json::json!({
            "route": report.route,
            "old_session_id": report.old_session_id,
            "new_session_id": report.new_session_id,
            "reason": report.reason.to_string(),
            "old_tokens": report.old_tokens,
            "new_tokens": report.new_tokens,
            "cost": report.cost,
        }))
        .into_response(),
        Ok(CompactOutcome::Busy) => api_error(
            StatusCode::CONFLICT,
            "route is busy, stop the running turn or retry once it finishes",
        ),
        Err(e) => {
            tracing::warn!(route = %route, error = %e, "manual compaction failed");
            api_error(StatusCode::BAD_GATEWAY, format!("compaction failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::api::test_support::*;

    #[tokio::test]
    async fn submit_without_providers_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "SB_TEST_ROUTES_NO_TOKEN");

        let (status, body) = call(
            &state,
            post_json("/v1/routes/web:1/messages", serde_json::json!({ "text": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("no LLM providers"));
        assert!(state.routes.get("web:1").is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_404_and_stop_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "SB_TEST_ROUTES_NO_TOKEN");

        let (status, _) = call(&state, get("/v1/routes/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, post_json("/v1/routes/nope/compact", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&state, post_json("/v1/routes/nope/stop", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], false);
    }

    #[tokio::test]
    async fn lists_known_routes_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "SB_TEST_ROUTES_NO_TOKEN");
        let (entry, created) = state.routes.resolve_or_create("web:7");
        assert!(created);

        let (status, body) = call(&state, get("/v1/routes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["routes"][0]["route"], "web:7");
        assert_eq!(body["routes"][0]["session_id"], entry.session_id);
        assert_eq!(body["routes"][0]["busy"], false);
    }

    #[test]
    fn text_images_and_blocks_combine() {
        let req: super::SubmitRequest = serde_json::from_value(serde_json::json!({
            "text": "look",
            "images": [{ "media_type": "image/png", "data": "iVBORw0KGgo=" }],
            "content": [{ "type": "text", "text": "more" }]
        }))
        .unwrap();
        let blocks = req.into_blocks();
        assert_eq!(blocks.len(), 3);
        assert!(matches!(blocks[1], sb_domain::tool::ContentBlock::Image { .. }));
    }
}
