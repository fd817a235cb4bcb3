//! Session compaction.
//!
//! Compaction never rewrites a session.  The old log is summarized by the
//! summarizer model and a follow-on session is started: its log holds the
//! system prompt and one user message carrying the summary.  The route is
//! then pointed at the new session with the predecessor's cost record
//! carried forward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use sb_domain::config::{CompactionConfig, ModelPricing};
use sb_domain::cost::{MessageCost, SessionCostRecord};
use sb_domain::error::{Error, Result};
use sb_domain::estimate::{estimate_cost, estimate_message_tokens, estimate_text_tokens};
use sb_domain::tool::{ContentBlock, Message, Role};
use sb_domain::trace::TraceEvent;
use sb_providers::{ChatRequest, LlmProvider, ProviderRegistry, ROLE_EXECUTOR, ROLE_SUMMARIZER};
use sb_sessions::{
    messages_of, should_compact, CompactReason, MessageStore, RouteEntry, RouteStore, SessionEntry,
};

use super::repair::repair;
use super::turn::PromptSource;

/// Header of the first message in a compacted session.
pub const SUMMARY_PREAMBLE: &str = "[This conversation continues from a previous session that was compacted. Summary of the prior conversation:]";

const SUMMARY_INSTRUCTIONS: &str = "You are a conversation summarizer. Summarize the conversation \
     below so that it can be continued without the original transcript. Preserve:\n\
     1. The current goal or plan being worked on\n\
     2. Key decisions made\n\
     3. Open questions or threads\n\
     4. Important facts learned about the user or context\n\
     5. Tool state (running processes, files touched, pending work)\n\n\
     Be concise but preserve all actionable context. Write in present tense.\n\
     Omit greetings and pleasantries. Focus on substance.";

/// What a compaction did.
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub route: String,
    pub old_session_id: String,
    pub new_session_id: String,
    pub reason: CompactReason,
    pub old_tokens: u64,
    pub new_tokens: u64,
    pub cost: SessionCostRecord,
}

pub struct SessionLifecycle {
    pub llm: Arc<ProviderRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub routes: Arc<RouteStore>,
    pub system_prompt: PromptSource,
    pub pricing: HashMap<String, ModelPricing>,
    pub config: CompactionConfig,
}

impl SessionLifecycle {
    /// Whether the route's current session is due for compaction.
    pub async fn check(&self, route: &str) -> Result<Option<CompactReason>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let Some(entry) = self.routes.get(route) else {
            return Ok(None);
        };
        let tokens = self.store.estimated_token_count(&entry.session_id).await?;
        if tokens == 0 {
            return Ok(None);
        }
        let last = self.store.last_activity(&entry.session_id).await?;
        let system_tokens = estimate_text_tokens(&(self.system_prompt)());
        Ok(should_compact(last, tokens, system_tokens, Utc::now(), &self.config))
    }

    /// Replace the route's current session with a summarized follow-on.
    ///
    /// Errors (store or summarizer) leave the route on its old session.
    pub async fn compact(&self, route: &str, reason: CompactReason) -> Result<CompactionReport> {
        let (entry, _) = self.routes.resolve_or_create(route);
        let old_id = entry.session_id.clone();

        let entries = self.store.load(&old_id).await?;
        let history = repair(&messages_of(&entries));
        let old_tokens: u64 = history.iter().map(estimate_message_tokens).sum();

        tracing::info!(
            route,
            session_id = %old_id,
            %reason,
            old_tokens,
            messages = history.len(),
            "compacting session"
        );

        let (seed, summary_cost) = if history.is_empty() {
            (None, MessageCost::default())
        } else {
            let (summary, cost) = self.summarize(&history).await?;
            let seed = Message::user_text(format!("{SUMMARY_PREAMBLE}\n\n{summary}"));
            (Some(seed), cost)
        };

        let new_id = uuid::Uuid::new_v4().to_string();
        let mut new_entries = vec![SessionEntry::system_prompt((self.system_prompt)())];
        if let Some(seed) = &seed {
            new_entries.push(SessionEntry::message(seed.clone(), None));
        }
        self.store.overwrite(&new_id, new_entries).await?;

        let cost = entry.cost.carry_forward(&old_id, &summary_cost);
        self.replace(&entry, &new_id, cost.clone());

        let new_tokens = seed.as_ref().map_or(0, estimate_message_tokens);
        TraceEvent::SessionCompacted {
            route: route.to_owned(),
            old_session_id: old_id.clone(),
            new_session_id: new_id.clone(),
            reason: reason.to_string(),
            old_tokens,
            new_tokens,
        }
        .emit();

        Ok(CompactionReport {
            route: route.to_owned(),
            old_session_id: old_id,
            new_session_id: new_id,
            reason,
            old_tokens,
            new_tokens,
            cost,
        })
    }

    fn replace(&self, entry: &RouteEntry, new_id: &str, cost: SessionCostRecord) {
        if let Some(previous) = self.routes.replace_session(&entry.route, new_id, cost) {
            if previous.session_id != entry.session_id {
                tracing::warn!(
                    route = %entry.route,
                    expected = %entry.session_id,
                    found = %previous.session_id,
                    "route moved during compaction"
                );
            }
        }
    }

    async fn summarize(&self, history: &[Message]) -> Result<(String, MessageCost)> {
        let (provider, model) = self.summarizer()?;
        let transcript = render_transcript(history, self.config.summary_tool_result_chars);

        let req = ChatRequest {
            system: Some(SUMMARY_INSTRUCTIONS.into()),
            messages: vec![Message::user_text(format!("CONVERSATION:\n{transcript}"))],
            tools: Vec::new(),
            model: Some(model.clone()),
            max_tokens: Some(self.config.summary_max_tokens),
            temperature: Some(0.1),
            cache_hints: false,
        };

        let resp = provider.chat(&req).await?;
        let summary = resp.content.trim();
        if summary.is_empty() {
            return Err(Error::Provider {
                provider: provider.provider_id().to_owned(),
                message: "summarizer returned an empty summary".into(),
            });
        }

        let cost = MessageCost {
            usage: resp.usage,
            cost: estimate_cost(&resp.usage, self.pricing.get(&model)),
        };
        tracing::debug!(
            summary_len = summary.len(),
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            "summary generated"
        );
        Ok((summary.to_owned(), cost))
    }

    /// The summarizer role, falling back to the executor.
    fn summarizer(&self) -> Result<(Arc<dyn LlmProvider>, String)> {
        self.llm
            .resolve_role(ROLE_SUMMARIZER)
            .or_else(|_| self.llm.resolve_role(ROLE_EXECUTOR))
    }
}

// ── Transcript rendering ───────────────────────────────────────────

/// Render history as plain text for the summarizer.  Tool results longer
/// than `max_result_chars` keep their first half and last quarter.
fn render_transcript(history: &[Message], max_result_chars: usize) -> String {
    let mut buf = String::new();
    for msg in history {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => {
                    buf.push_str(&format!("{label}: {text}\n"));
                }
                ContentBlock::Image { .. } => {
                    buf.push_str(&format!("{label}: [image]\n"));
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    buf.push_str(&format!("Assistant called {name}: {input}\n"));
                }
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => {
                    let tag = if *is_error { "Tool error" } else { "Tool result" };
                    let text = shorten(&content.as_text(), max_result_chars);
                    buf.push_str(&format!("{tag}: {text}\n"));
                }
            }
        }
    }
    buf
}

fn shorten(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_owned();
    }
    let head: String = text.chars().take(max / 2).collect();
    let tail: String = text.chars().skip(total - max / 4).collect();
    format!("{head} [...] {tail}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
