//! `switchboard chat`: interactive REPL on a route.
//!
//! Each line is submitted to the route and the response streamed back.
//! Slash-commands switch routes and trigger compaction.

use std::sync::Arc;

use tokio::sync::Notify;

use sb_domain::config::Config;
use sb_domain::tool::ContentBlock;

use crate::bootstrap;
use crate::runtime::{CompactOutcome, OutputFn, TurnEvent};
use crate::state::AppState;

use super::run::print_event;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(config: Arc<Config>, mut route: String) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config, Arc::new(Notify::new()))?;
    if state.llm.is_empty() {
        anyhow::bail!("no LLM providers are configured");
    }

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".switchboard")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    // Banner on stderr keeps stdout clean for output.
    eprintln!("switchboard interactive chat");
    eprintln!("Route: {route}  |  Type /help for commands, Ctrl+D to exit");
    eprintln!();

    let output: OutputFn = Arc::new(|event: TurnEvent| {
        print_event(&event);
    });

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();

                if trimmed.starts_with('/') {
                    if handle_slash_command(&state, trimmed, &mut route).await {
                        break;
                    }
                    continue;
                }

                state.controller.submit(
                    &route,
                    vec![ContentBlock::text(trimmed)],
                    Some(output.clone()),
                );
                state.controller.wait_idle(&route).await;
                println!();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Use Ctrl+D or /quit to exit)");
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("\x1B[31mreadline error: {e}\x1B[0m");
                break;
            }
        }
    }

    rl.save_history(&history_path).ok();
    if let Err(e) = state.routes.flush() {
        tracing::warn!(error = %e, "route store flush on exit failed");
    }
    eprintln!("Goodbye!");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slash commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returns `true` if the REPL should exit.
async fn handle_slash_command(state: &AppState, input: &str, route: &mut String) -> bool {
    let (cmd, arg) = match input.split_once(' ') {
        Some((c, a)) => (c, Some(a.trim()).filter(|a| !a.is_empty())),
        None => (input, None),
    };

    match cmd {
        "/exit" | "/quit" => return true,

        "/route" => match arg {
            Some(name) => {
                *route = name.to_string();
                eprintln!("Route switched to: {route}");
            }
            None => {
                eprintln!("Current route: {route}");
                if let Some(entry) = state.routes.get(route) {
                    eprintln!(
                        "Session: {}  |  cost so far: ${:.4}",
                        entry.session_id, entry.cost.cost.pessimistic
                    );
                }
                eprintln!("Usage: /route <name>");
            }
        },

        "/compact" => match state.controller.compact_now(route).await {
            Ok(CompactOutcome::Compacted(report)) => eprintln!(
                "Compacted: {} -> {} tokens, new session {}",
                report.old_tokens, report.new_tokens, report.new_session_id
            ),
            Ok(CompactOutcome::Busy) => eprintln!("Route is busy, try again shortly."),
            Err(e) => eprintln!("\x1B[31mcompaction failed: {e}\x1B[0m"),
        },

        "/help" => {
            eprintln!("Commands:");
            eprintln!("  /route <name>   Switch to another route");
            eprintln!("  /compact        Summarize the session and start a fresh one");
            eprintln!("  /exit, /quit    Exit the chat");
            eprintln!("  /help           Show this help");
        }

        other => eprintln!("Unknown command: {other}  (type /help for a list)"),
    }

    false
}
