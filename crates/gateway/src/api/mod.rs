pub mod auth;
pub mod cors;
pub mod routes;
pub mod sessions;
pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (health check) and **protected**
/// (gated behind the bearer-token middleware when a token is configured).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(health));

    let protected = Router::new()
        // Routes (conversation channels)
        .route("/v1/routes", get(routes::list_routes))
        .route("/v1/routes/:route", get(routes::get_route))
        .route("/v1/routes/:route/messages", post(routes::submit_message))
        .route("/v1/routes/:route/stop", post(routes::stop_route))
        .route("/v1/routes/:route/compact", post(routes::compact_route))
        .route("/v1/routes/:route/ws", get(ws::route_ws))
        // Sessions (transcripts and live events)
        .route("/v1/sessions/:id/messages", get(sessions::get_messages))
        .route("/v1/sessions/:id/events", get(sessions::session_events_sse))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.llm.is_empty() { "degraded" } else { "ok" };
    let active: Vec<_> = state
        .controller
        .snapshot()
        .into_iter()
        .filter(|r| r.busy)
        .collect();
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.llm.list_providers(),
        "roles": state.llm.list_roles(),
        "active_routes": active,
    }))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use sb_domain::config::Config;

    use crate::state::AppState;

    pub fn app_state(dir: &std::path::Path, token_env: &str) -> AppState {
        let mut config = Config::default();
        config.sessions.state_path = dir.to_path_buf();
        config.server.api_token_env = token_env.into();
        crate::bootstrap::build_app_state(Arc::new(config), Arc::new(Notify::new())).unwrap()
    }

    pub async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let app = super::router(state.clone()).with_state(state.clone());
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[tokio::test]
    async fn health_reports_degraded_without_providers() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "SB_TEST_HEALTH_NO_TOKEN");

        let (status, body) = call(&state, get("/v1/health")).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["providers"], serde_json::json!([]));
    }
}
