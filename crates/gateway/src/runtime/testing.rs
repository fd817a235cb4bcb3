//! Test doubles shared by the runtime tests: a scripted provider, a
//! closure-backed tool, an in-memory pending queue, and a controller
//! wired to all of them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sb_domain::config::{CompactionConfig, ToolsConfig};
use sb_domain::error::{Error, Result};
use sb_domain::stream::{BoxStream, StreamEvent, Usage};
use sb_domain::tool::{ContentBlock, Message, ToolDefinition};
use sb_providers::{ChatRequest, ChatResponse, LlmProvider, ProviderRegistry, ROLE_EXECUTOR};
use sb_sessions::{messages_of, MemoryMessageStore, MessageStore, RouteStore};

use super::compact::SessionLifecycle;
use super::controller::Controller;
use super::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
use super::turn::{EventSink, PendingInput, TurnEngine, TurnEvent};

pub const MODEL: &str = "mock-model";

// ── Scripted provider ──────────────────────────────────────────────

/// One step of a scripted model round.
#[derive(Clone)]
pub enum Step {
    Emit(StreamEvent),
    /// Block until the notify is signalled.
    WaitFor(Arc<Notify>),
    /// Block until the turn is cancelled, then end the stream.
    WaitCancel(Usage),
}

pub fn text(t: &str) -> Step {
    Step::Emit(StreamEvent::Token { text: t.into() })
}

pub fn tool_call(id: &str, name: &str, args: Value) -> Step {
    Step::Emit(StreamEvent::ToolCallFinished {
        call_id: id.into(),
        tool_name: name.into(),
        arguments: args,
    })
}

pub fn done(input_tokens: u64, output_tokens: u64) -> Step {
    Step::Emit(StreamEvent::Done {
        usage: Some(Usage {
            input_tokens,
            output_tokens,
            ..Default::default()
        }),
        finish_reason: Some("stop".into()),
    })
}

/// Replays queued rounds in order; answers "ok" once the script runs out.
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<Vec<Step>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub summary: Mutex<Result<String>>,
    pub summary_usage: Mutex<Usage>,
    /// When set, summary calls block until it is signalled.
    pub summary_gate: Mutex<Option<Arc<Notify>>>,
    pub chat_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
            summary: Mutex::new(Ok("Summary of earlier work.".into())),
            summary_usage: Mutex::new(Usage::default()),
            summary_gate: Mutex::new(None),
            chat_calls: AtomicUsize::new(0),
        })
    }

    pub fn push_round(&self, steps: Vec<Step>) {
        self.rounds.lock().push_back(steps);
    }

    pub fn stream_calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn summary_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        let gate = self.summary_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let content = match &*self.summary.lock() {
            Ok(s) => s.clone(),
            Err(e) => return Err(Error::Other(e.to_string())),
        };
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
            usage: *self.summary_usage.lock(),
            model: MODEL.into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req.clone());
        let steps = self
            .rounds
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![text("ok"), done(1, 1)]);
        let cancel = cancel.unwrap_or_default();

        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    Step::Emit(event) => yield Ok(event),
                    Step::WaitFor(notify) => notify.notified().await,
                    Step::WaitCancel(usage) => {
                        cancel.cancelled().await;
                        yield Ok(StreamEvent::Done {
                            usage: Some(usage),
                            finish_reason: Some("cancelled".into()),
                        });
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        MODEL
    }
}

pub fn registry_with(provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
    let mut reg = ProviderRegistry::default();
    reg.insert(provider);
    reg.set_role(ROLE_EXECUTOR, &format!("mock/{MODEL}"));
    Arc::new(reg)
}

// ── Tools ──────────────────────────────────────────────────────────

type ToolFn = dyn Fn(&Value, &ToolContext) -> ToolOutput + Send + Sync;

/// A tool whose behaviour is a closure.  Counts its invocations.
pub struct FnTool {
    name: String,
    f: Box<ToolFn>,
    pub calls: AtomicUsize,
}

impl FnTool {
    pub fn new(
        name: &str,
        f: impl Fn(&Value, &ToolContext) -> ToolOutput + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            f: Box::new(f),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("test tool {}", self.name),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.f)(&input, ctx))
    }
}

// ── Pending queue ──────────────────────────────────────────────────

#[derive(Default)]
pub struct TestQueue(pub Mutex<VecDeque<Vec<ContentBlock>>>);

impl TestQueue {
    pub fn push_text(&self, t: &str) {
        self.0.lock().push_back(vec![ContentBlock::text(t)]);
    }
}

impl PendingInput for TestQueue {
    fn has_pending(&self) -> bool {
        !self.0.lock().is_empty()
    }

    fn take_pending(&self) -> Option<Vec<ContentBlock>> {
        let mut q = self.0.lock();
        if q.is_empty() {
            return None;
        }
        Some(q.drain(..).flatten().collect())
    }
}

// ── Engine wiring ──────────────────────────────────────────────────

pub struct Harness {
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<MemoryMessageStore>,
    pub tools: Arc<ToolRegistry>,
    pub engine: Arc<TurnEngine>,
}

pub fn harness(rounds: Vec<Vec<Step>>) -> Harness {
    harness_with_limits(rounds, ToolsConfig::default())
}

pub fn harness_with_limits(rounds: Vec<Vec<Step>>, limits: ToolsConfig) -> Harness {
    let provider = ScriptedProvider::new(rounds);
    let store = Arc::new(MemoryMessageStore::new());
    let tools = Arc::new(ToolRegistry::new());
    let engine = Arc::new(TurnEngine {
        llm: registry_with(provider.clone()),
        store: store.clone() as Arc<dyn MessageStore>,
        tools: tools.clone(),
        system_prompt: Arc::new(|| "You are a test agent.".to_string()),
        working_dir: PathBuf::from("."),
        pricing: Default::default(),
        limits,
    });
    Harness {
        provider,
        store,
        tools,
        engine,
    }
}

/// An event sink that records everything it sees.
pub fn recorder() -> (EventSink, Arc<Mutex<Vec<TurnEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |ev| sink_events.lock().push(ev));
    (sink, events)
}

// ── Controller wiring ──────────────────────────────────────────────

pub struct Rig {
    pub h: Harness,
    pub routes: Arc<RouteStore>,
    pub controller: Arc<Controller>,
    pub _dir: tempfile::TempDir,
}

pub fn rig(rounds: Vec<Vec<Step>>, compaction: CompactionConfig) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(rounds);
    let routes = Arc::new(RouteStore::new(dir.path()).unwrap());
    let lifecycle = Arc::new(SessionLifecycle {
        llm: h.engine.llm.clone(),
        store: h.engine.store.clone(),
        routes: routes.clone(),
        system_prompt: h.engine.system_prompt.clone(),
        pricing: HashMap::new(),
        config: compaction,
    });
    let controller = Controller::new(h.engine.clone(), lifecycle, routes.clone());
    Rig {
        h,
        routes,
        controller,
        _dir: dir,
    }
}

impl Rig {
    /// Messages of the route's current session.
    pub async fn history(&self, route: &str) -> Vec<Message> {
        let sid = self.routes.get(route).unwrap().session_id;
        messages_of(&self.h.store.load(&sid).await.unwrap())
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
