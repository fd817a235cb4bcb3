use std::sync::Arc;

use tokio::sync::Notify;

use sb_domain::config::Config;
use sb_providers::ProviderRegistry;
use sb_sessions::{MessageStore, RouteStore};

use crate::runtime::tools::ToolRegistry;
use crate::runtime::Controller;

/// Shared application state passed to all API handlers and CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,

    // ── Sessions ──────────────────────────────────────────────────────
    pub store: Arc<dyn MessageStore>,
    pub routes: Arc<RouteStore>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub controller: Arc<Controller>,
    /// Signalled by the restart tool and SIGTERM to stop the server.
    pub shutdown: Arc<Notify>,

    // ── Security ──────────────────────────────────────────────────────
    /// SHA-256 of the API bearer token, read once at startup.  `None`
    /// disables auth.
    pub api_token_hash: Option<Vec<u8>>,
}
