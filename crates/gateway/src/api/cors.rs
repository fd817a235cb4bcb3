//! CORS policy built from `server.cors.allowed_origins`.
//!
//! Entries are exact origins, host patterns with a `:*` port wildcard
//! (e.g. `http://localhost:*`), or a lone `"*"` that allows everything.

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use sb_domain::config::CorsConfig;

const METHODS: [Method; 4] = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

pub fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods(METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\", all origins allowed");
        return base.allow_origin(Any);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut port_wildcards: Vec<String> = Vec::new();
    for origin in &cors.allowed_origins {
        if let Some(prefix) = origin.strip_suffix('*').filter(|p| p.ends_with(':')) {
            port_wildcards.push(prefix.to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    if port_wildcards.is_empty() {
        return base.allow_origin(AllowOrigin::list(exact));
    }
    base.allow_origin(AllowOrigin::predicate(move |origin, _| {
        if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
            return true;
        }
        let origin = origin.to_str().unwrap_or("");
        port_wildcards.iter().any(|prefix| {
            origin
                .strip_prefix(prefix.as_str())
                .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        })
    }))
}
