//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use, streaming, and
//! prompt caching.  The domain message model already mirrors Anthropic's
//! content blocks, so messages serialize directly.

use std::collections::HashMap;

use sb_domain::config::ProviderConfig;
use sb_domain::error::{Error, Result};
use sb_domain::stream::{BoxStream, StreamEvent, Usage};
use sb_domain::tool::{Role, ToolCall, ToolDefinition};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sse::SseParser;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, resolve_api_key};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    max_output_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new provider from the deserialized provider config.
    pub fn from_config(cfg: &ProviderConfig, timeout_sec: u64) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_sec))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            max_output_tokens: cfg.max_output_tokens,
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!(provider = %self.id, url = %url, "anthropic request");

        let resp = self
            .authed_post(&url)
            .json(body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }
        Ok(resp)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request body
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn ephemeral() -> Value {
    serde_json::json!({ "type": "ephemeral" })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

fn build_messages_body(
    req: &ChatRequest,
    default_model: &str,
    default_max_tokens: u32,
    stream: bool,
) -> Result<Value> {
    let model = req.model.as_deref().unwrap_or(default_model);
    let mut messages = serde_json::to_value(&req.messages)?;

    if req.cache_hints {
        let last_user = req.messages.iter().rposition(|m| m.role == Role::User);
        if let Some(block) = last_user
            .and_then(|i| messages.get_mut(i))
            .and_then(|m| m.get_mut("content"))
            .and_then(|c| c.as_array_mut())
            .and_then(|blocks| blocks.last_mut())
        {
            block["cache_control"] = ephemeral();
        }
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": req.max_tokens.unwrap_or(default_max_tokens),
        "stream": stream,
    });

    if let Some(system) = req.system.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = if req.cache_hints {
            serde_json::json!([{ "type": "text", "text": system, "cache_control": ephemeral() }])
        } else {
            Value::String(system.to_owned())
        };
    }

    if !req.tools.is_empty() {
        let mut tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
        if req.cache_hints {
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = ephemeral();
            }
        }
        body["tools"] = Value::Array(tools);
    }

    if let Some(temp) = req.temperature {
        body["temperature"] = serde_json::json!(temp);
    }

    Ok(body)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// Overlay any usage counters present in `v` onto `usage`.
fn merge_usage(usage: &mut Usage, v: &Value) {
    let get = |key: &str| v.get(key).and_then(|n| n.as_u64());
    if let Some(n) = get("input_tokens") {
        usage.input_tokens = n;
    }
    if let Some(n) = get("output_tokens") {
        usage.output_tokens = n;
    }
    if let Some(n) = get("cache_read_input_tokens") {
        usage.cache_read_tokens = n;
    }
    if let Some(n) = get("cache_creation_input_tokens") {
        usage.cache_write_tokens = n;
    }
}

fn parse_anthropic_response(body: &Value) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in body
        .get("content")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => text_parts.push(str_field(block, "text")),
            "tool_use" => tool_calls.push(ToolCall {
                id: str_field(block, "id"),
                name: str_field(block, "name"),
                input: block
                    .get("input")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default())),
            }),
            _ => {}
        }
    }

    let mut usage = Usage::default();
    if let Some(u) = body.get("usage") {
        merge_usage(&mut usage, u);
    }

    ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage,
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(map_stop_reason),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call assembly and usage tracking across SSE payloads.
#[derive(Default)]
struct StreamState {
    /// Block index -> (call_id, name, args_buffer).
    active_tool_calls: HashMap<u64, (String, String, String)>,
    usage: Usage,
    done_emitted: bool,
}

impl SseParser for StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        parse_anthropic_sse(data, self)
    }

    fn on_cancel(&mut self) -> Vec<Result<StreamEvent>> {
        self.done_emitted = true;
        vec![Ok(StreamEvent::Done {
            usage: Some(self.usage),
            finish_reason: Some("cancelled".into()),
        })]
    }
}

/// Parse a single Anthropic SSE data payload into stream events.
fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };
    let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(u) = v.get("message").and_then(|m| m.get("usage")) {
                merge_usage(&mut state.usage, u);
            }
        }

        "content_block_start" => {
            let Some(block) = v.get("content_block") else {
                return events;
            };
            match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "tool_use" => {
                    let call_id = str_field(block, "id");
                    let name = str_field(block, "name");
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                    }));
                    state
                        .active_tool_calls
                        .insert(idx, (call_id, name, String::new()));
                }
                "text" => {
                    let text = str_field(block, "text");
                    if !text.is_empty() {
                        events.push(Ok(StreamEvent::Token { text }));
                    }
                }
                _ => {}
            }
        }

        "content_block_delta" => {
            let Some(delta) = v.get("delta") else {
                return events;
            };
            match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text_delta" => {
                    let text = str_field(delta, "text");
                    if !text.is_empty() {
                        events.push(Ok(StreamEvent::Token { text }));
                    }
                }
                "input_json_delta" => {
                    let partial = str_field(delta, "partial_json");
                    if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                        tc.2.push_str(&partial);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: tc.0.clone(),
                            delta: partial,
                        }));
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            if let Some((call_id, tool_name, args)) = state.active_tool_calls.remove(&idx) {
                let arguments = if args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&args) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(
                                call_id = %call_id,
                                tool = %tool_name,
                                error = %e,
                                "tool input is not valid JSON; using empty object"
                            );
                            Value::Object(Default::default())
                        }
                    }
                };
                events.push(Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }));
            }
        }

        "message_delta" => {
            if let Some(u) = v.get("usage") {
                merge_usage(&mut state.usage, u);
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(map_stop_reason);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: Some(state.usage),
                    finish_reason: stop_reason,
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: Some(state.usage),
                    finish_reason: Some("stop".into()),
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error {
                message: msg.to_string(),
            }));
        }

        // ping and unknown event types
        _ => {}
    }

    events
}

/// Stream for a request abandoned before the response headers arrived.
fn cancelled_before_response() -> BoxStream<'static, Result<StreamEvent>> {
    Box::pin(async_stream::stream! {
        yield Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("cancelled".into()),
        });
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = build_messages_body(req, &self.default_model, self.max_output_tokens, false)?;
        let resp = self.send(&body).await?;
        let resp_json: Value = resp.json().await.map_err(from_reqwest)?;
        Ok(parse_anthropic_response(&resp_json))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = build_messages_body(req, &self.default_model, self.max_output_tokens, true)?;
        let resp = match &cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(provider = %self.id, "request cancelled before response");
                    return Ok(cancelled_before_response());
                }
                resp = self.send(&body) => resp?,
            },
            None => self.send(&body).await?,
        };
        Ok(crate::sse::sse_response_stream(
            resp,
            StreamState::default(),
            cancel,
        ))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
