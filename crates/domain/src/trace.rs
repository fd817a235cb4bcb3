use serde::Serialize;

/// Structured audit events emitted across all switchboard crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        route: String,
        session_id: String,
    },
    SessionCompacted {
        route: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
        old_tokens: u64,
        new_tokens: u64,
    },
    StoreAppend {
        session_id: String,
        entries: usize,
    },
    StoreOverwrite {
        session_id: String,
        entries: usize,
    },
    TurnQueued {
        route: String,
        depth: usize,
    },
    TurnAborted {
        route: String,
        session_id: String,
    },
    TurnCompleted {
        route: String,
        session_id: String,
        loops: usize,
        input_tokens: u64,
        output_tokens: u64,
    },
    RestartResumed {
        route: String,
        session_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sb_event");
    }
}
