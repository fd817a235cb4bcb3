//! Turn execution engine.
//!
//! One turn takes a user message through as many model round-trips as the
//! model needs: stream a response, run the tool calls it asked for, feed
//! the results back, repeat until it answers without calling a tool.
//!
//! Every message is appended to the session log the moment it exists, so
//! an abort or crash at any point leaves a history that [`repair`] can
//! make well-formed again.  Each assistant message carries the usage and
//! cost of the model call that produced it.
//!
//! Two things can cut a round short:
//!
//! - the cancel token fires: streaming stops, the partial response is kept,
//!   and unexecuted tool calls get interrupted results;
//! - new input arrives on the route while tools are running: the remaining
//!   calls of the round are skipped with interrupted results and the new
//!   input is injected as its own user message before the next model call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use sb_domain::config::{ModelPricing, ToolsConfig};
use sb_domain::cost::{CostEstimate, MessageCost};
use sb_domain::error::{Error, Result};
use sb_domain::estimate::estimate_cost;
use sb_domain::stream::{StreamEvent, Usage};
use sb_domain::tool::{ContentBlock, Message, ToolCall};
use sb_providers::{ChatRequest, LlmProvider, ProviderRegistry, ROLE_EXECUTOR};
use sb_sessions::{messages_of, MessageStore, SessionEntry};

use super::repair::repair;
use super::tools::{truncate_result_content, ToolContext, ToolOutput, ToolRegistry};

/// Result text for calls skipped because the turn was stopped.
pub const STOPPED_RESULT: &str = "(interrupted - stopped by user)";
/// Result text for calls skipped because new input arrived.
pub const SUPERSEDED_RESULT: &str = "(interrupted - a new message arrived)";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted while a route is working.  Streamed to observers over
/// SSE and WebSocket, and to the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Incremental text from the assistant.
    AssistantDelta { text: String },

    /// The model is invoking a tool.
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Tool execution result (possibly truncated or synthetic).
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// Input queued during the turn was handed to the model.
    QueuedInjected { text: String },

    /// The final assistant text of the turn.
    Final { content: String },

    /// The turn was aborted on request.
    Stopped { route: String },

    Error { message: String },

    /// Usage and cost of one model call.
    Usage { usage: Usage, cost: CostEstimate },

    /// The route moved to a follow-on session.
    Compacted {
        old_session_id: String,
        new_session_id: String,
        reason: String,
        old_tokens: u64,
        new_tokens: u64,
    },

    /// The message was queued behind a running turn.
    Queued { position: usize },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs and outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives turn events.  Must not block.
pub type EventSink = Arc<dyn Fn(TurnEvent) + Send + Sync>;

/// Produces the system prompt; called before every model request.
pub type PromptSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Input that arrived on the route while the turn was running.
pub trait PendingInput: Send + Sync {
    fn has_pending(&self) -> bool;

    /// Remove and return all pending input as one message body.
    fn take_pending(&self) -> Option<Vec<ContentBlock>>;
}

pub struct TurnInput {
    pub route: String,
    pub session_id: String,
    pub content: Vec<ContentBlock>,
    pub cancel: CancellationToken,
    pub pending: Option<Arc<dyn PendingInput>>,
    pub sink: Option<EventSink>,
}

#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// Messages appended to the session by this turn.
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub aborted: bool,
    /// Model round-trips made.
    pub loops: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnEngine {
    pub llm: Arc<ProviderRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub tools: Arc<ToolRegistry>,
    pub system_prompt: PromptSource,
    pub working_dir: PathBuf,
    /// Pricing by model name.
    pub pricing: HashMap<String, ModelPricing>,
    pub limits: ToolsConfig,
}

/// One streamed model response.
#[derive(Default)]
struct Round {
    blocks: Vec<ContentBlock>,
    usage: Usage,
}

impl Round {
    fn tool_calls(&self) -> Vec<ToolCall> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn push_text(&mut self, text: &str) {
        if let Some(ContentBlock::Text { text: last }) = self.blocks.last_mut() {
            last.push_str(text);
        } else {
            self.blocks.push(ContentBlock::text(text));
        }
    }
}

impl TurnEngine {
    pub fn system_prompt(&self) -> String {
        (self.system_prompt)()
    }

    /// Run one turn for `input.session_id`.
    ///
    /// Errors from the store or the model abort the turn and are returned;
    /// whatever was persisted before the failure stays in the log.
    pub async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome> {
        let span = tracing::info_span!(
            "turn",
            route = %input.route,
            session_id = %input.session_id,
            "otel.kind" = "SERVER",
        );
        self.run_turn_inner(input).instrument(span).await
    }

    async fn run_turn_inner(&self, input: TurnInput) -> Result<TurnOutcome> {
        let TurnInput {
            route,
            session_id,
            content,
            cancel,
            pending,
            sink,
        } = input;
        let emit = |event: TurnEvent| {
            if let Some(sink) = &sink {
                sink(event);
            }
        };

        let (provider, model) = self.llm.resolve_role(ROLE_EXECUTOR)?;
        let pricing = self.pricing.get(&model);

        // ── Load and repair history ──────────────────────────────
        let entries = self.store.load(&session_id).await?;
        if entries.is_empty() {
            self.store
                .append(&session_id, SessionEntry::system_prompt(self.system_prompt()))
                .await?;
        }
        let mut history = repair(&messages_of(&entries));
        let mut outcome = TurnOutcome::default();

        self.record(&session_id, Message::user(content), None, &mut history, &mut outcome)
            .await?;

        let ctx = ToolContext {
            route,
            session_id,
            working_dir: self.working_dir.clone(),
            cancel: cancel.clone(),
        };

        // ── Tool loop ────────────────────────────────────────────
        for loop_idx in 0..self.limits.max_tool_loops {
            if cancel.is_cancelled() {
                outcome.aborted = true;
                return Ok(outcome);
            }
            outcome.loops = loop_idx + 1;
            tracing::debug!(loop_idx, "tool loop iteration");

            // Prompt and tools are re-read every round so edits apply
            // mid-session.
            let req = ChatRequest {
                system: Some(self.system_prompt()),
                messages: history.clone(),
                tools: self.tools.definitions(),
                model: Some(model.clone()),
                max_tokens: None,
                temperature: None,
                cache_hints: true,
            };

            let llm_span = tracing::info_span!(
                "llm.call",
                "otel.kind" = "CLIENT",
                model = %model,
                loop_idx,
                input_tokens = tracing::field::Empty,
                output_tokens = tracing::field::Empty,
            );
            let round = stream_round(provider.as_ref(), &req, &cancel, &emit)
                .instrument(llm_span.clone())
                .await?;
            llm_span.record("input_tokens", round.usage.input_tokens);
            llm_span.record("output_tokens", round.usage.output_tokens);

            outcome.usage.add(&round.usage);
            let cost = MessageCost {
                usage: round.usage,
                cost: estimate_cost(&round.usage, pricing),
            };
            emit(TurnEvent::Usage {
                usage: cost.usage,
                cost: cost.cost,
            });

            let calls = round.tool_calls();
            let final_text = if round.blocks.is_empty() {
                String::new()
            } else {
                let assistant = Message::assistant(round.blocks);
                let text = assistant.text();
                self.record(&ctx.session_id, assistant, Some(cost), &mut history, &mut outcome)
                    .await?;
                text
            };

            if cancel.is_cancelled() {
                if !calls.is_empty() {
                    let results = calls
                        .iter()
                        .map(|c| interrupted(c, STOPPED_RESULT, &emit))
                        .collect();
                    self.record(&ctx.session_id, Message::user(results), None, &mut history, &mut outcome)
                        .await?;
                }
                tracing::info!("turn aborted during model call");
                outcome.aborted = true;
                return Ok(outcome);
            }

            if calls.is_empty() {
                emit(TurnEvent::Final {
                    content: final_text,
                });
                return Ok(outcome);
            }

            // ── Execute tools ────────────────────────────────────
            let results = self
                .execute_round(&calls, &ctx, pending.as_deref(), &emit)
                .await;
            self.record(&ctx.session_id, Message::user(results), None, &mut history, &mut outcome)
                .await?;

            if cancel.is_cancelled() {
                tracing::info!("turn aborted during tool execution");
                outcome.aborted = true;
                return Ok(outcome);
            }

            // ── Inject input that arrived mid-round ──────────────
            // Not on the last round: no model call would answer it, so it
            // stays queued for a follow-up turn.
            let last_round = loop_idx + 1 == self.limits.max_tool_loops;
            if last_round {
                continue;
            }
            if let Some(blocks) = pending.as_ref().and_then(|p| p.take_pending()) {
                let injected = Message::user(blocks);
                tracing::debug!("injecting queued input into running turn");
                emit(TurnEvent::QueuedInjected {
                    text: injected.text(),
                });
                self.record(&ctx.session_id, injected, None, &mut history, &mut outcome)
                    .await?;
            }
        }

        let max = self.limits.max_tool_loops;
        tracing::warn!(max, "tool loop limit reached");
        emit(TurnEvent::Error {
            message: format!("tool loop limit ({max}) reached"),
        });
        Ok(outcome)
    }

    /// Persist a message and add it to the working history.
    async fn record(
        &self,
        session_id: &str,
        message: Message,
        cost: Option<MessageCost>,
        history: &mut Vec<Message>,
        outcome: &mut TurnOutcome,
    ) -> Result<()> {
        self.store
            .append(session_id, SessionEntry::message(message.clone(), cost))
            .await?;
        history.push(message.clone());
        outcome.messages.push(message);
        Ok(())
    }

    /// Run the calls of one round in order.  Returns one result block per
    /// call, in call order.
    async fn execute_round(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        pending: Option<&dyn PendingInput>,
        emit: &impl Fn(TurnEvent),
    ) -> Vec<ContentBlock> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if ctx.cancel.is_cancelled() {
                results.push(interrupted(call, STOPPED_RESULT, emit));
                continue;
            }
            if pending.is_some_and(|p| p.has_pending()) {
                tracing::debug!(tool = %call.name, "skipping tool call, new input is waiting");
                results.push(interrupted(call, SUPERSEDED_RESULT, emit));
                continue;
            }

            emit(TurnEvent::ToolCall {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.input.clone(),
            });

            let tool_span = tracing::info_span!(
                "tool.call",
                tool_name = %call.name,
                call_id = %call.id,
            );
            let output = self.execute_tool(call, ctx).instrument(tool_span).await;

            let (content, dropped) = truncate_result_content(
                output.content,
                self.limits.max_result_chars,
                self.limits.truncate_head_chars,
                self.limits.truncate_tail_chars,
            );
            if dropped > 0 {
                tracing::debug!(tool = %call.name, dropped, "tool result truncated");
            }

            emit(TurnEvent::ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: content.as_text(),
                is_error: output.is_error,
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content,
                is_error: output.is_error,
            });
        }

        results
    }

    async fn execute_tool(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            return ToolOutput::error(format!("Unknown tool: {}", call.name));
        };
        match tool.execute(call.input.clone(), ctx).await {
            Ok(output) => output,
            Err(Error::Cancelled) => ToolOutput::error(STOPPED_RESULT),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool failed");
                ToolOutput::error(format!("tool error: {e}"))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Consume one streamed response.  On cancellation the provider ends the
/// stream early with whatever usage it saw; the partial response is
/// returned as-is.
async fn stream_round(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
    cancel: &CancellationToken,
    emit: &impl Fn(TurnEvent),
) -> Result<Round> {
    let mut stream = provider.chat_stream(req, Some(cancel.clone())).await?;
    let mut round = Round::default();
    // call_id -> argument JSON still being streamed
    let mut partial: Vec<(String, String)> = Vec::new();

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Token { text } => {
                round.push_text(&text);
                emit(TurnEvent::AssistantDelta { text });
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                round.blocks.push(ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: tool_name,
                    input: Value::Null,
                });
                partial.push((call_id, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = partial.iter_mut().find(|(id, _)| *id == call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                partial.retain(|(id, _)| *id != call_id);
                let existing = round.blocks.iter_mut().find_map(|b| match b {
                    ContentBlock::ToolUse { id, input, .. } if *id == call_id => Some(input),
                    _ => None,
                });
                match existing {
                    Some(input) => *input = arguments,
                    None => round.blocks.push(ContentBlock::ToolUse {
                        id: call_id,
                        name: tool_name,
                        input: arguments,
                    }),
                }
            }
            StreamEvent::Done { usage, .. } => {
                if let Some(usage) = usage {
                    round.usage.add(&usage);
                }
            }
            StreamEvent::Error { message } => {
                return Err(Error::Provider {
                    provider: provider.provider_id().to_owned(),
                    message,
                });
            }
        }
    }

    // Calls that only arrived as start + deltas.
    for (call_id, args) in partial {
        let parsed = parse_arguments(&call_id, &args);
        for block in &mut round.blocks {
            if let ContentBlock::ToolUse { id, input, .. } = block {
                if *id == call_id {
                    *input = parsed.clone();
                }
            }
        }
    }

    Ok(round)
}

fn parse_arguments(call_id: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) | Err(_) => {
            tracing::warn!(
                call_id = %call_id,
                "tool call arguments are not a JSON object; defaulting to empty object"
            );
            Value::Object(Default::default())
        }
    }
}

fn interrupted(call: &ToolCall, reason: &str, emit: &impl Fn(TurnEvent)) -> ContentBlock {
    emit(TurnEvent::ToolResult {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: reason.to_owned(),
        is_error: true,
    });
    ContentBlock::tool_result(&call.id, reason, true)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::*;
    use sb_domain::tool::Role;
    use serde_json::json;

    fn input(content: &str) -> TurnInput {
        TurnInput {
            route: "test".into(),
            session_id: "s1".into(),
            content: vec![ContentBlock::text(content)],
            cancel: CancellationToken::new(),
            pending: None,
            sink: None,
        }
    }

    async fn stored(h: &Harness) -> Vec<Message> {
        let entries = h.store.load("s1").await.unwrap();
        messages_of(&entries)
    }

    #[tokio::test]
    async fn plain_reply_persists_with_cost() {
        let mut h = harness(vec![vec![text("Hel"), text("lo"), done(100, 20)]]);
        Arc::get_mut(&mut h.engine).unwrap().pricing.insert(
            MODEL.into(),
            ModelPricing {
                input_per_1m: 3.0,
                output_per_1m: 15.0,
                cache_read_per_1m: None,
                cache_write_per_1m: None,
            },
        );
        let (sink, events) = recorder();

        let outcome = h
            .engine
            .run_turn(TurnInput {
                sink: Some(sink),
                ..input("hi")
            })
            .await
            .unwrap();

        assert_eq!(outcome.loops, 1);
        assert!(!outcome.aborted);
        assert_eq!(outcome.usage.input_tokens, 100);

        let entries = h.store.load("s1").await.unwrap();
        assert!(matches!(entries[0], SessionEntry::SystemPrompt { .. }));
        match &entries[2] {
            SessionEntry::Message {
                message,
                cost: Some(cost),
                ..
            } => {
                assert_eq!(message.text(), "Hello");
                assert_eq!(cost.usage.output_tokens, 20);
                let expected = (100.0 * 3.0 + 20.0 * 15.0) / 1_000_000.0;
                assert!((cost.cost.optimistic - expected).abs() < 1e-12);
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        let events = events.lock();
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Final {
                content: "Hello".into()
            })
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::AssistantDelta { text } if text == "lo")));
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back() {
        let h = harness(vec![
            vec![text("checking"), tool_call("c1", "lookup", json!({"q": 1})), done(10, 5)],
            vec![text("all good"), done(20, 5)],
        ]);
        let lookup = FnTool::new("lookup", |input, _| ToolOutput::text(format!("saw {}", input["q"])));
        h.tools.register(lookup.clone());

        let outcome = h.engine.run_turn(input("go")).await.unwrap();
        assert_eq!(outcome.loops, 2);
        assert_eq!(lookup.count(), 1);
        assert_eq!(outcome.usage.input_tokens, 30);

        let second = &h.provider.requests.lock()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, vec![ContentBlock::tool_result("c1", "saw 1", false)]);

        let history = stored(&h).await;
        assert_eq!(history.len(), 4);
        assert_eq!(repair(&history), history);
    }

    #[tokio::test]
    async fn tools_are_reread_each_round() {
        let h = harness(vec![
            vec![tool_call("c1", "install", json!({})), done(1, 1)],
            vec![text("done"), done(1, 1)],
        ]);
        let tools = h.tools.clone();
        h.tools.register(FnTool::new("install", move |_, _| {
            tools.register(FnTool::new("fresh", |_, _| ToolOutput::text("")));
            ToolOutput::text("installed")
        }));

        h.engine.run_turn(input("go")).await.unwrap();
        let requests = h.provider.requests.lock();
        let names = |i: usize| -> Vec<String> {
            requests[i].tools.iter().map(|t| t.name.clone()).collect()
        };
        assert_eq!(names(0), vec!["install"]);
        assert_eq!(names(1), vec!["install", "fresh"]);
    }

    #[tokio::test]
    async fn new_input_interrupts_rest_of_round() {
        let h = harness(vec![
            vec![
                tool_call("c1", "first", json!({})),
                tool_call("c2", "second", json!({})),
                done(1, 1),
            ],
            vec![text("switching"), done(1, 1)],
        ]);
        let queue = Arc::new(TestQueue::default());
        let q = queue.clone();
        let first = FnTool::new("first", move |_, _| {
            q.push_text("actually, stop that");
            ToolOutput::text("ran")
        });
        let second = FnTool::new("second", |_, _| ToolOutput::text("ran"));
        h.tools.register(first.clone());
        h.tools.register(second.clone());

        let outcome = h
            .engine
            .run_turn(TurnInput {
                pending: Some(queue.clone()),
                ..input("go")
            })
            .await
            .unwrap();

        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
        assert!(!queue.has_pending());
        assert_eq!(outcome.loops, 2);

        let history = stored(&h).await;
        // user, assistant(calls), user(results), user(injected), assistant
        assert_eq!(history.len(), 5);
        assert_eq!(
            history[2].content[1],
            ContentBlock::tool_result("c2", SUPERSEDED_RESULT, true)
        );
        assert!(!history[3].has_tool_result());
        assert_eq!(history[3].text(), "actually, stop that");

        let second_req = &h.provider.requests.lock()[1];
        assert_eq!(second_req.messages.last().unwrap().text(), "actually, stop that");
    }

    #[tokio::test]
    async fn abort_mid_stream_keeps_partial_response() {
        let h = harness(vec![vec![
            text("working on"),
            tool_call("c1", "lookup", json!({})),
            Step::WaitCancel(Usage {
                input_tokens: 50,
                output_tokens: 3,
                ..Default::default()
            }),
        ]]);
        let lookup = FnTool::new("lookup", |_, _| ToolOutput::text("never"));
        h.tools.register(lookup.clone());

        let turn = input("go");
        let cancel = turn.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = h.engine.run_turn(turn).await.unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.usage.input_tokens, 50);
        assert_eq!(lookup.count(), 0);

        let history = stored(&h).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].text(), "working on");
        assert_eq!(
            history[2].content,
            vec![ContentBlock::tool_result("c1", STOPPED_RESULT, true)]
        );
        assert_eq!(repair(&history), history);
    }

    #[tokio::test]
    async fn loop_limit_reports_error() {
        let limits = ToolsConfig {
            max_tool_loops: 2,
            ..Default::default()
        };
        let h = harness_with_limits(
            vec![
                vec![tool_call("c1", "lookup", json!({})), done(1, 1)],
                vec![tool_call("c2", "lookup", json!({})), done(1, 1)],
            ],
            limits,
        );
        h.tools.register(FnTool::new("lookup", |_, _| ToolOutput::text("again")));
        let (sink, events) = recorder();

        let outcome = h
            .engine
            .run_turn(TurnInput {
                sink: Some(sink),
                ..input("go")
            })
            .await
            .unwrap();
        assert_eq!(outcome.loops, 2);
        assert!(matches!(
            events.lock().last(),
            Some(TurnEvent::Error { message }) if message.contains("limit")
        ));
    }

    #[tokio::test]
    async fn input_after_last_round_stays_queued() {
        let limits = ToolsConfig {
            max_tool_loops: 1,
            ..Default::default()
        };
        let h = harness_with_limits(
            vec![vec![tool_call("c1", "first", json!({})), done(1, 1)]],
            limits,
        );
        let queue = Arc::new(TestQueue::default());
        let q = queue.clone();
        h.tools.register(FnTool::new("first", move |_, _| {
            q.push_text("one more thing");
            ToolOutput::text("ran")
        }));

        let outcome = h
            .engine
            .run_turn(TurnInput {
                pending: Some(queue.clone()),
                ..input("go")
            })
            .await
            .unwrap();

        assert_eq!(outcome.loops, 1);
        assert!(queue.has_pending());
        let history = stored(&h).await;
        // user, assistant(call), user(result); nothing injected
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|m| m.text() != "one more thing"));
    }

    #[tokio::test]
    async fn long_results_are_truncated() {
        let limits = ToolsConfig {
            max_result_chars: 100,
            truncate_head_chars: 10,
            truncate_tail_chars: 10,
            ..Default::default()
        };
        let h = harness_with_limits(
            vec![
                vec![tool_call("c1", "dump", json!({})), done(1, 1)],
                vec![text("ok"), done(1, 1)],
            ],
            limits,
        );
        h.tools.register(FnTool::new("dump", |_, _| ToolOutput::text("x".repeat(500))));

        h.engine.run_turn(input("go")).await.unwrap();
        let history = stored(&h).await;
        match &history[2].content[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert!(content.as_text().contains("[truncated 480 characters]"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let h = harness(vec![
            vec![tool_call("c1", "missing", json!({})), done(1, 1)],
            vec![text("ok"), done(1, 1)],
        ]);
        h.engine.run_turn(input("go")).await.unwrap();
        let history = stored(&h).await;
        assert_eq!(
            history[2].content,
            vec![ContentBlock::tool_result("c1", "Unknown tool: missing", true)]
        );
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let h = harness(vec![vec![
            text("partial"),
            Step::Emit(StreamEvent::Error {
                message: "overloaded".into(),
            }),
        ]]);
        let err = h.engine.run_turn(input("go")).await.unwrap_err();
        assert!(matches!(err, Error::Provider { ref message, .. } if message == "overloaded"));
        // The user message was persisted before the failure.
        assert_eq!(stored(&h).await.len(), 1);
    }

    #[tokio::test]
    async fn resumes_from_damaged_history() {
        let h = harness(vec![vec![text("recovered"), done(1, 1)]]);
        h.store
            .append("s1", SessionEntry::system_prompt("sys"))
            .await
            .unwrap();
        h.store
            .append(
                "s1",
                SessionEntry::message(
                    Message::assistant(vec![ContentBlock::ToolUse {
                        id: "dangling".into(),
                        name: "exec".into(),
                        input: json!({}),
                    }]),
                    None,
                ),
            )
            .await
            .unwrap();

        h.engine.run_turn(input("hello again")).await.unwrap();
        let sent = &h.provider.requests.lock()[0];
        assert!(sent.messages[1].has_result_for("dangling"));
        assert_eq!(sent.messages[2].text(), "hello again");
    }
}
