//! AppState construction shared by `serve`, `run` and `chat`, so every
//! command boots the same runtime with or without an HTTP listener.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use sb_domain::config::{Config, ConfigSeverity};
use sb_providers::ProviderRegistry;
use sb_sessions::{JsonlMessageStore, MessageStore, RouteStore};

use crate::runtime::tools::{ExecTool, RestartTool, ToolRegistry};
use crate::runtime::turn::PromptSource;
use crate::runtime::{Controller, SessionLifecycle, TurnEngine};
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub fn build_app_state(config: Arc<Config>, shutdown: Arc<Notify>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── LLM providers ────────────────────────────────────────────────
    let llm = Arc::new(
        ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?,
    );
    if llm.is_empty() {
        tracing::info!("no LLM providers initialized, configure API keys to enable turns");
    } else {
        tracing::info!(providers = llm.len(), "LLM provider registry ready");
    }

    // ── Session storage ──────────────────────────────────────────────
    let state_path = config.sessions.state_path.clone();
    let routes = Arc::new(RouteStore::new(&state_path).context("initializing route store")?);
    let store: Arc<dyn MessageStore> = Arc::new(
        JsonlMessageStore::new(&routes.sessions_dir()).context("initializing session logs")?,
    );
    tracing::info!(path = %state_path.display(), "session storage ready");

    // ── Tools ────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    if config.tools.exec.enabled {
        tools.register(Arc::new(ExecTool::new(config.tools.exec.timeout_sec)));
    }
    tools.register(Arc::new(RestartTool::new(state_path.clone(), shutdown.clone())));
    tracing::info!(tools = ?tools.names(), "tool registry ready");

    // ── Runtime ──────────────────────────────────────────────────────
    let system_prompt = prompt_source(&config);
    let engine = Arc::new(TurnEngine {
        llm: llm.clone(),
        store: store.clone(),
        tools: tools.clone(),
        system_prompt: system_prompt.clone(),
        working_dir: config.sessions.working_dir.clone(),
        pricing: config.llm.pricing.clone(),
        limits: config.tools.clone(),
    });
    let lifecycle = Arc::new(SessionLifecycle {
        llm: llm.clone(),
        store: store.clone(),
        routes: routes.clone(),
        system_prompt,
        pricing: config.llm.pricing.clone(),
        config: config.compaction.clone(),
    });
    let controller = Controller::new(engine, lifecycle, routes.clone());
    tracing::info!(
        compaction = config.compaction.enabled,
        token_ceiling = config.compaction.token_ceiling,
        "controller ready"
    );

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(token) => {
                tracing::info!(source = %format!("env:{env_var}"), "API bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("API bearer-token auth DISABLED, set the {env_var} env var to enable it");
                None
            }
        }
    };

    Ok(AppState {
        config,
        llm,
        store,
        routes,
        tools,
        controller,
        shutdown,
        api_token_hash,
    })
}

/// The system prompt: re-read from `system_prompt_file` on every call when
/// set, falling back to the inline prompt if the file cannot be read.
fn prompt_source(config: &Config) -> PromptSource {
    let inline = config.sessions.system_prompt.clone();
    match config.sessions.system_prompt_file.clone() {
        None => Arc::new(move || inline.clone()),
        Some(path) => Arc::new(move || read_prompt_file(&path).unwrap_or_else(|| inline.clone())),
    }
}

fn read_prompt_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Some(s),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "system prompt file is empty, using inline prompt");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read system prompt file");
            None
        }
    }
}
