//! History repair.
//!
//! Stored history can be left malformed by crashes, aborts, or messages
//! that arrived while a tool round was in flight.  [`repair`] restores the
//! structure the provider requires:
//!
//! - consecutive assistant messages are merged into one;
//! - every tool call gets exactly one result, placed in the user message
//!   directly after the call, in call order;
//! - user text that landed between a call and its result is moved after
//!   the result message;
//! - calls without a result get a synthetic error result.
//!
//! Repair is pure and idempotent.  Only the synthetic results and the text
//! rendering of stray results are added; nothing else is dropped.

use sb_domain::tool::{ContentBlock, Message, Role};

/// Content of the result synthesized for a call that never got one.
pub const INTERRUPTED_RESULT: &str = "(interrupted - no result received)";

/// Repair a message history (see module docs).
pub fn repair(messages: &[Message]) -> Vec<Message> {
    let merged = merge_assistant_runs(messages);
    let mut out: Vec<Message> = Vec::with_capacity(merged.len() + 1);

    let mut i = 0;
    while i < merged.len() {
        let msg = &merged[i];
        i += 1;

        if msg.role != Role::Assistant || !msg.has_tool_use() {
            out.push(stray_results_to_text(msg.clone()));
            continue;
        }
        out.push(msg.clone());

        // The user messages between this call and the next assistant turn.
        let window_end = merged[i..]
            .iter()
            .position(|m| m.role == Role::Assistant)
            .map_or(merged.len(), |p| i + p);
        let window = &merged[i..window_end];
        i = window_end;

        let call_ids: Vec<&str> = msg.tool_uses().map(|(id, _, _)| id).collect();
        let mut results: Vec<Option<ContentBlock>> = vec![None; call_ids.len()];
        let mut rest: Vec<Message> = Vec::new();

        for user in window {
            let mut kept = Vec::new();
            for block in &user.content {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    if let Some(pos) = call_ids.iter().position(|id| id == tool_use_id) {
                        if results[pos].is_none() {
                            results[pos] = Some(block.clone());
                            continue;
                        }
                    }
                }
                kept.push(block.clone());
            }
            if !kept.is_empty() {
                rest.push(Message::user(kept));
            }
        }

        let result_blocks = call_ids
            .iter()
            .zip(results)
            .map(|(id, found)| {
                found.unwrap_or_else(|| {
                    tracing::debug!(tool_use_id = %id, "synthesizing missing tool result");
                    ContentBlock::tool_result(*id, INTERRUPTED_RESULT, true)
                })
            })
            .collect();
        out.push(Message::user(result_blocks));

        // Whatever remains is ordinary user input; results in it have no
        // matching call and would be rejected by the provider.
        out.extend(rest.into_iter().map(stray_results_to_text));
    }

    out
}

/// Merge runs of assistant messages and drop empty messages.
fn merge_assistant_runs(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.content.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev.role == Role::Assistant && msg.role == Role::Assistant => {
                prev.content.extend(msg.content.iter().cloned());
            }
            _ => out.push(msg.clone()),
        }
    }
    out
}

/// Render tool results that answer no call as plain text.
fn stray_results_to_text(mut msg: Message) -> Message {
    if msg.role != Role::User || !msg.has_tool_result() {
        return msg;
    }
    msg.content = msg
        .content
        .into_iter()
        .map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let status = if is_error { " (error)" } else { "" };
                ContentBlock::text(format!(
                    "[unmatched tool result for {tool_use_id}{status}]: {}",
                    content.as_text()
                ))
            }
            other => other,
        })
        .collect();
    msg
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
