//! Per-route concurrency controller.
//!
//! Each route runs at most one turn at a time.  Messages that arrive while
//! a route is busy are queued; the running turn may pick them up between
//! tool rounds, and anything left when it ends is drained as one combined
//! follow-up turn.  A stop request cancels the running turn only; queued
//! messages still run afterwards.  Every sender whose message a turn
//! carries receives that turn's events.
//!
//! Compaction is checked before a message is admitted and after every
//! turn, while the route is still marked busy, so no turn ever runs
//! against a session that is being replaced.
//!
//! Input sources (sockets, bridges) feed the controller through bounded
//! channels created with [`Controller::spawn_source`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

use sb_domain::cost::MessageCost;
use sb_domain::error::Result;
use sb_domain::tool::ContentBlock;
use sb_domain::trace::TraceEvent;
use sb_sessions::{CompactReason, RouteStore};

use super::compact::{CompactionReport, SessionLifecycle};
use super::turn::{EventSink, PendingInput, TurnEngine, TurnEvent, TurnInput};

/// Capacity of each session's broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where a route's or a message's events are delivered.
pub type OutputFn = Arc<dyn Fn(TurnEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Started,
    Queued { position: usize },
}

#[derive(Debug)]
pub enum CompactOutcome {
    Compacted(CompactionReport),
    Busy,
}

/// A message from an input source.
pub struct SourceMessage {
    pub route: String,
    pub content: Vec<ContentBlock>,
    /// Receives this message's events in addition to the route output.
    pub output: Option<OutputFn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub route: String,
    pub busy: bool,
    pub queued: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route slots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Pending {
    content: Vec<ContentBlock>,
    outputs: Vec<OutputFn>,
}

impl Pending {
    fn new(content: Vec<ContentBlock>, output: Option<OutputFn>) -> Self {
        Self {
            content,
            outputs: output.into_iter().collect(),
        }
    }
}

/// Per-message outputs of the running turn.  Grows when queued input is
/// injected.
type Origins = Arc<Mutex<Vec<OutputFn>>>;

fn add_outputs(into: &mut Vec<OutputFn>, from: Vec<OutputFn>) {
    for out in from {
        if !into.iter().any(|o| Arc::ptr_eq(o, &out)) {
            into.push(out);
        }
    }
}

#[derive(Default)]
struct SlotState {
    busy: bool,
    queue: VecDeque<Pending>,
    /// Abort signal of the message being handled, from the moment the
    /// route goes busy for it until its turn ends.
    cancel: Option<CancellationToken>,
    output: Option<OutputFn>,
}

impl SlotState {
    fn arm(&mut self) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        cancel
    }
}

struct RouteSlot {
    route: String,
    state: Mutex<SlotState>,
    idle: Notify,
}

impl RouteSlot {
    fn new(route: &str) -> Self {
        Self {
            route: route.to_owned(),
            state: Mutex::new(SlotState::default()),
            idle: Notify::new(),
        }
    }

    /// Take everything queued as one message with a fresh abort token, or
    /// mark the route idle.
    fn next_or_release(&self) -> Option<(Pending, CancellationToken)> {
        let mut st = self.state.lock();
        if st.queue.is_empty() {
            st.busy = false;
            st.cancel = None;
            drop(st);
            self.idle.notify_waiters();
            return None;
        }
        let drained: Vec<Pending> = st.queue.drain(..).collect();
        let cancel = st.arm();
        drop(st);
        tracing::debug!(route = %self.route, count = drained.len(), "draining queued messages");
        Some((merge(drained), cancel))
    }

    fn route_output(&self) -> Option<OutputFn> {
        self.state.lock().output.clone()
    }
}

fn merge(messages: Vec<Pending>) -> Pending {
    let mut content = Vec::new();
    let mut outputs = Vec::new();
    for m in messages {
        content.extend(m.content);
        add_outputs(&mut outputs, m.outputs);
    }
    Pending { content, outputs }
}

/// The running turn's view of its route's queue.  Senders of injected
/// input join the turn's outputs.
struct SlotInput {
    slot: Arc<RouteSlot>,
    origins: Origins,
}

impl PendingInput for SlotInput {
    fn has_pending(&self) -> bool {
        !self.slot.state.lock().queue.is_empty()
    }

    fn take_pending(&self) -> Option<Vec<ContentBlock>> {
        let drained: Vec<Pending> = self.slot.state.lock().queue.drain(..).collect();
        if drained.is_empty() {
            return None;
        }
        let merged = merge(drained);
        add_outputs(&mut self.origins.lock(), merged.outputs);
        Some(merged.content)
    }
}

/// Clears the busy flag if a drive task unwinds.
struct BusyGuard {
    slot: Arc<RouteSlot>,
    armed: bool,
}

impl BusyGuard {
    fn new(slot: Arc<RouteSlot>) -> Self {
        Self { slot, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::error!(route = %self.slot.route, "route task ended abnormally, releasing route");
        {
            let mut st = self.slot.state.lock();
            st.busy = false;
            st.cancel = None;
        }
        self.slot.idle.notify_waiters();
    }
}

/// Send an event to the message senders and to the route output, each
/// once.
fn deliver(slot: &RouteSlot, origins: &[OutputFn], event: &TurnEvent) {
    let route_out = slot.route_output();
    for origin in origins {
        origin(event.clone());
    }
    if let Some(out) = route_out {
        if !origins.iter().any(|o| Arc::ptr_eq(o, &out)) {
            out(event.clone());
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Controller {
    engine: Arc<TurnEngine>,
    lifecycle: Arc<SessionLifecycle>,
    routes: Arc<RouteStore>,
    slots: Mutex<HashMap<String, Arc<RouteSlot>>>,
    /// session_id -> event fan-out for observers.
    channels: Mutex<HashMap<String, broadcast::Sender<TurnEvent>>>,
}

impl Controller {
    pub fn new(
        engine: Arc<TurnEngine>,
        lifecycle: Arc<SessionLifecycle>,
        routes: Arc<RouteStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            lifecycle,
            routes,
            slots: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn routes(&self) -> &Arc<RouteStore> {
        &self.routes
    }

    fn slot(&self, route: &str) -> Arc<RouteSlot> {
        self.slots
            .lock()
            .entry(route.to_owned())
            .or_insert_with(|| Arc::new(RouteSlot::new(route)))
            .clone()
    }

    fn existing_slot(&self, route: &str) -> Option<Arc<RouteSlot>> {
        self.slots.lock().get(route).cloned()
    }

    // ── Input ──────────────────────────────────────────────────────

    /// Start a turn on an idle route or queue the message behind the
    /// running one.
    pub fn submit(
        self: &Arc<Self>,
        route: &str,
        content: Vec<ContentBlock>,
        output: Option<OutputFn>,
    ) -> SubmitOutcome {
        let slot = self.slot(route);
        let cancel = {
            let mut st = slot.state.lock();
            if st.busy {
                st.queue.push_back(Pending::new(content, output.clone()));
                let position = st.queue.len();
                drop(st);

                TraceEvent::TurnQueued {
                    route: route.to_owned(),
                    depth: position,
                }
                .emit();
                let event = TurnEvent::Queued { position };
                let origins: Vec<OutputFn> = output.into_iter().collect();
                deliver(&slot, &origins, &event);
                if let Some(entry) = self.routes.get(route) {
                    self.publish(&entry.session_id, event);
                }
                return SubmitOutcome::Queued { position };
            }
            st.busy = true;
            st.arm()
        };

        let this = Arc::clone(self);
        let first = Pending::new(content, output);
        tokio::spawn(async move { this.drive(slot, first, cancel).await });
        SubmitOutcome::Started
    }

    /// Feed the controller from a bounded channel.  The task ends when
    /// every sender is dropped.
    pub fn spawn_source(self: &Arc<Self>, name: &str, capacity: usize) -> mpsc::Sender<SourceMessage> {
        let (tx, mut rx) = mpsc::channel::<SourceMessage>(capacity);
        let this = Arc::clone(self);
        let name = name.to_owned();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let outcome = this.submit(&msg.route, msg.content, msg.output);
                tracing::debug!(source = %name, route = %msg.route, ?outcome, "source message submitted");
            }
            tracing::debug!(source = %name, "input source closed");
        });
        tx
    }

    /// Abort the message being handled on `route`, including one still
    /// waiting on pre-turn compaction.  Returns false when nothing was
    /// running.
    pub fn stop(&self, route: &str) -> bool {
        let Some(slot) = self.existing_slot(route) else {
            return false;
        };
        let st = slot.state.lock();
        match (&st.cancel, st.busy) {
            (Some(cancel), true) => {
                tracing::info!(route, "stop requested");
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    // ── Observation ────────────────────────────────────────────────

    fn channel(&self, session_id: &str) -> broadcast::Sender<TurnEvent> {
        self.channels
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Events of the session's turns as they happen.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<TurnEvent> {
        self.channel(session_id).subscribe()
    }

    fn publish(&self, session_id: &str, event: TurnEvent) {
        let tx = self.channels.lock().get(session_id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    /// Register the function that receives all events of `route`.
    pub fn set_output(&self, route: &str, output: OutputFn) {
        self.slot(route).state.lock().output = Some(output);
    }

    pub fn clear_output(&self, route: &str) {
        if let Some(slot) = self.existing_slot(route) {
            slot.state.lock().output = None;
        }
    }

    pub fn status(&self, route: &str) -> RouteStatus {
        match self.existing_slot(route) {
            Some(slot) => {
                let st = slot.state.lock();
                RouteStatus {
                    route: route.to_owned(),
                    busy: st.busy,
                    queued: st.queue.len(),
                }
            }
            None => RouteStatus {
                route: route.to_owned(),
                busy: false,
                queued: 0,
            },
        }
    }

    pub fn is_busy(&self, route: &str) -> bool {
        self.status(route).busy
    }

    /// Status of every route seen since startup, sorted by route.
    pub fn snapshot(&self) -> Vec<RouteStatus> {
        let routes: Vec<String> = self.slots.lock().keys().cloned().collect();
        let mut out: Vec<RouteStatus> = routes.iter().map(|r| self.status(r)).collect();
        out.sort_by(|a, b| a.route.cmp(&b.route));
        out
    }

    /// Wait until `route` has no running turn and nothing queued.
    pub async fn wait_idle(&self, route: &str) {
        let Some(slot) = self.existing_slot(route) else {
            return;
        };
        loop {
            let notified = slot.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !slot.state.lock().busy {
                return;
            }
            notified.await;
        }
    }

    // ── Compaction ─────────────────────────────────────────────────

    /// Compact the route now unless a turn is running.  Messages queued
    /// meanwhile run once compaction finishes.
    pub async fn compact_now(self: &Arc<Self>, route: &str) -> Result<CompactOutcome> {
        let slot = self.slot(route);
        {
            let mut st = slot.state.lock();
            if st.busy {
                return Ok(CompactOutcome::Busy);
            }
            st.busy = true;
        }
        let guard = BusyGuard::new(slot.clone());

        let result = self.lifecycle.compact(route, CompactReason::Manual).await;
        if let Ok(report) = &result {
            self.announce_compaction(&slot, report, &[]);
        }

        if let Some((next, cancel)) = slot.next_or_release() {
            let this = Arc::clone(self);
            let slot = slot.clone();
            tokio::spawn(async move { this.drive(slot, next, cancel).await });
        }
        guard.disarm();

        result.map(CompactOutcome::Compacted)
    }

    async fn compact_if_due(&self, slot: &RouteSlot, origins: &[OutputFn]) {
        let route = slot.route.as_str();
        let reason = match self.lifecycle.check(route).await {
            Ok(Some(reason)) => reason,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(route, error = %e, "compaction check failed");
                return;
            }
        };

        match self.lifecycle.compact(route, reason).await {
            Ok(report) => self.announce_compaction(slot, &report, origins),
            Err(e) => {
                tracing::warn!(route, error = %e, "compaction failed, keeping current session");
                let event = TurnEvent::Error {
                    message: format!("compaction failed: {e}"),
                };
                deliver(slot, origins, &event);
                if let Some(entry) = self.routes.get(route) {
                    self.publish(&entry.session_id, event);
                }
            }
        }
    }

    fn announce_compaction(&self, slot: &RouteSlot, report: &CompactionReport, origins: &[OutputFn]) {
        let event = TurnEvent::Compacted {
            old_session_id: report.old_session_id.clone(),
            new_session_id: report.new_session_id.clone(),
            reason: report.reason.to_string(),
            old_tokens: report.old_tokens,
            new_tokens: report.new_tokens,
        };
        deliver(slot, origins, &event);
        self.publish(&report.old_session_id, event);
        // Observers of the old session see the channel close.
        self.channels.lock().remove(&report.old_session_id);
    }

    // ── Turn driving ───────────────────────────────────────────────

    async fn drive(self: Arc<Self>, slot: Arc<RouteSlot>, first: Pending, cancel: CancellationToken) {
        let guard = BusyGuard::new(slot.clone());
        let mut next = Some((first, cancel));
        while let Some((msg, cancel)) = next.take() {
            self.run_one(&slot, msg, cancel).await;
            next = slot.next_or_release();
        }
        guard.disarm();
    }

    async fn run_one(&self, slot: &Arc<RouteSlot>, msg: Pending, cancel: CancellationToken) {
        let route = slot.route.clone();
        let origins: Origins = Arc::new(Mutex::new(msg.outputs));

        let before = origins.lock().clone();
        self.compact_if_due(slot, &before).await;

        let (entry, _) = self.routes.resolve_or_create(&route);
        let session_id = entry.session_id;
        let sink = self.turn_sink(slot, &session_id, origins.clone());

        // A stop that landed during compaction still records the message;
        // the engine sees the cancelled token and ends the turn at once.
        if cancel.is_cancelled() {
            tracing::info!(route = %route, "stopped before the turn started");
        }

        let pending: Arc<dyn PendingInput> = Arc::new(SlotInput {
            slot: slot.clone(),
            origins: origins.clone(),
        });

        let result = self
            .engine
            .run_turn(TurnInput {
                route: route.clone(),
                session_id: session_id.clone(),
                content: msg.content,
                cancel,
                pending: Some(pending),
                sink: Some(sink.clone()),
            })
            .await;
        slot.state.lock().cancel = None;

        match result {
            Ok(outcome) if outcome.aborted => {
                TraceEvent::TurnAborted {
                    route: route.clone(),
                    session_id,
                }
                .emit();
                sink(TurnEvent::Stopped { route: route.clone() });
            }
            Ok(outcome) => TraceEvent::TurnCompleted {
                route: route.clone(),
                session_id,
                loops: outcome.loops,
                input_tokens: outcome.usage.input_tokens,
                output_tokens: outcome.usage.output_tokens,
            }
            .emit(),
            Err(e) => {
                tracing::warn!(route = %route, error = %e, "turn failed");
                sink(TurnEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        self.routes.touch(&route);

        let after = origins.lock().clone();
        self.compact_if_due(slot, &after).await;
    }

    /// Fan a turn's events out to its senders, the route output, and the
    /// session observers.  Usage events are also charged to the route.
    fn turn_sink(&self, slot: &Arc<RouteSlot>, session_id: &str, origins: Origins) -> EventSink {
        let routes = self.routes.clone();
        let tx = self.channel(session_id);
        let slot = slot.clone();
        Arc::new(move |event: TurnEvent| {
            if let TurnEvent::Usage { usage, cost } = &event {
                routes.record_cost(&slot.route, &MessageCost {
                    usage: *usage,
                    cost: *cost,
                });
            }
            let targets = origins.lock().clone();
            deliver(&slot, &targets, &event);
            let _ = tx.send(event);
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
