//! `switchboard run`: one-shot execution.
//!
//! Submits a single message on a route, streams the response to stdout and
//! exits once the route is idle.  Tool activity goes to stderr so stdout
//! stays pipeable.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use sb_domain::config::Config;
use sb_domain::tool::ContentBlock;

use crate::bootstrap;
use crate::runtime::{OutputFn, TurnEvent};

/// Print one event the way the terminal commands show them.  Returns
/// `true` for events that indicate failure.
pub(crate) fn print_event(event: &TurnEvent) -> bool {
    match event {
        TurnEvent::AssistantDelta { text } => {
            print!("{text}");
            std::io::stdout().flush().ok();
        }
        TurnEvent::ToolCall { tool_name, .. } => {
            eprintln!("\x1b[2m[tool: {tool_name}]\x1b[0m");
        }
        TurnEvent::ToolResult { tool_name, is_error: true, .. } => {
            eprintln!("\x1b[2m[tool {tool_name} failed]\x1b[0m");
        }
        TurnEvent::QueuedInjected { .. } => {
            eprintln!("\x1b[2m[queued input handed to the model]\x1b[0m");
        }
        TurnEvent::Final { .. } => println!(),
        TurnEvent::Stopped { .. } => eprintln!("turn stopped"),
        TurnEvent::Compacted { old_tokens, new_tokens, reason, .. } => {
            eprintln!("\x1b[2m[session compacted ({reason}): {old_tokens} -> {new_tokens} tokens]\x1b[0m");
        }
        TurnEvent::Queued { position } => {
            eprintln!("\x1b[2m[queued at position {position}]\x1b[0m");
        }
        TurnEvent::Error { message } => {
            eprintln!("error: {message}");
            return true;
        }
        TurnEvent::ToolResult { .. } | TurnEvent::Usage { .. } => {}
    }
    false
}

/// Entry point for `switchboard run "message"`.
pub async fn run(
    config: Arc<Config>,
    message: String,
    route: String,
    json_output: bool,
) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config, Arc::new(Notify::new()))?;
    if state.llm.is_empty() {
        anyhow::bail!("no LLM providers are configured");
    }

    let failed = Arc::new(Mutex::new(false));
    let collected: Arc<Mutex<Vec<TurnEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let output: OutputFn = {
        let failed = failed.clone();
        let collected = collected.clone();
        Arc::new(move |event: TurnEvent| {
            if json_output {
                if matches!(event, TurnEvent::Error { .. }) {
                    *failed.lock() = true;
                }
                collected.lock().push(event);
            } else if print_event(&event) {
                *failed.lock() = true;
            }
        })
    };

    state
        .controller
        .submit(&route, vec![ContentBlock::text(message)], Some(output));
    state.controller.wait_idle(&route).await;

    if json_output {
        let json = serde_json::to_string_pretty(&*collected.lock())
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    if let Err(e) = state.routes.flush() {
        tracing::warn!(error = %e, "route store flush on exit failed");
    }

    if *failed.lock() {
        std::process::exit(1);
    }
    Ok(())
}
