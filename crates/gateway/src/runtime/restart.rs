//! Restart recovery.
//!
//! The `restart` tool writes `restart.json` under the state path before the
//! process shuts down.  On the next start the marker is consumed and the
//! route gets a synthetic user message so the agent carries on where it
//! left off.  Recovery is best effort: a missing or unreadable marker only
//! logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::error::Result;
use sb_domain::tool::ContentBlock;
use sb_domain::trace::TraceEvent;

use super::controller::Controller;

/// Text of the message that resumes a restarted route.
pub const RESUME_MESSAGE: &str =
    "[The process restarted as you requested. Continue where you left off.]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartMarker {
    pub route: String,
    pub session_id: String,
    pub requested_at: DateTime<Utc>,
}

impl RestartMarker {
    pub fn new(route: &str, session_id: &str) -> Self {
        Self {
            route: route.to_owned(),
            session_id: session_id.to_owned(),
            requested_at: Utc::now(),
        }
    }
}

fn marker_path(state_path: &Path) -> PathBuf {
    state_path.join("restart.json")
}

pub fn write_marker(state_path: &Path, marker: &RestartMarker) -> Result<()> {
    std::fs::create_dir_all(state_path)?;
    let json = serde_json::to_string_pretty(marker)?;
    std::fs::write(marker_path(state_path), json)?;
    Ok(())
}

/// Read and delete the marker.
pub fn take_marker(state_path: &Path) -> Option<RestartMarker> {
    let path = marker_path(state_path);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read restart marker");
            return None;
        }
    };
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove restart marker");
    }
    match serde_json::from_str(&raw) {
        Ok(marker) => Some(marker),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed restart marker");
            None
        }
    }
}

/// Resume the route named by a pending restart marker, if any.  Must run
/// before external input is accepted so the resumed turn goes first.
pub fn resume_after_restart(controller: &Arc<Controller>, state_path: &Path) -> Option<String> {
    let marker = take_marker(state_path)?;

    let current = controller.routes().get(&marker.route);
    match &current {
        Some(entry) if entry.session_id != marker.session_id => {
            tracing::warn!(
                route = %marker.route,
                marker_session = %marker.session_id,
                current_session = %entry.session_id,
                "route moved to a new session since the restart request"
            );
        }
        None => {
            tracing::warn!(route = %marker.route, "restart marker names an unknown route");
        }
        _ => {}
    }

    tracing::info!(
        route = %marker.route,
        requested_at = %marker.requested_at,
        "resuming route after restart"
    );
    TraceEvent::RestartResumed {
        route: marker.route.clone(),
        session_id: current.map_or(marker.session_id, |e| e.session_id),
    }
    .emit();

    controller.submit(&marker.route, vec![ContentBlock::text(RESUME_MESSAGE)], None);
    Some(marker.route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::*;
    use sb_domain::config::CompactionConfig;

    #[test]
    fn marker_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(take_marker(dir.path()).is_none());

        write_marker(dir.path(), &RestartMarker::new("discord:ops", "s-1")).unwrap();
        let marker = take_marker(dir.path()).unwrap();
        assert_eq!(marker.route, "discord:ops");
        assert!(take_marker(dir.path()).is_none());
    }

    #[test]
    fn malformed_marker_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("restart.json"), "not json").unwrap();
        assert!(take_marker(dir.path()).is_none());
        assert!(!dir.path().join("restart.json").exists());
    }

    #[tokio::test]
    async fn resumes_route_with_new_turn() {
        let r = rig(vec![vec![text("picking up"), done(1, 1)]], CompactionConfig::default());
        let (entry, _) = r.routes.resolve_or_create("discord:ops");
        let state = tempfile::tempdir().unwrap();
        write_marker(state.path(), &RestartMarker::new("discord:ops", &entry.session_id)).unwrap();

        let resumed = resume_after_restart(&r.controller, state.path());
        assert_eq!(resumed.as_deref(), Some("discord:ops"));
        r.controller.wait_idle("discord:ops").await;

        let hist = r.history("discord:ops").await;
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].text(), RESUME_MESSAGE);
        assert_eq!(hist[1].text(), "picking up");
        assert!(!state.path().join("restart.json").exists());
    }

    #[tokio::test]
    async fn moved_route_resumes_on_current_session() {
        let r = rig(vec![], CompactionConfig::default());
        let (entry, _) = r.routes.resolve_or_create("r");
        let state = tempfile::tempdir().unwrap();
        write_marker(state.path(), &RestartMarker::new("r", "compacted-away")).unwrap();

        assert_eq!(resume_after_restart(&r.controller, state.path()).as_deref(), Some("r"));
        r.controller.wait_idle("r").await;

        assert_eq!(r.routes.get("r").unwrap().session_id, entry.session_id);
        assert_eq!(r.history("r").await[0].text(), RESUME_MESSAGE);
    }

    #[tokio::test]
    async fn unknown_route_is_created_and_resumed() {
        let r = rig(vec![], CompactionConfig::default());
        let state = tempfile::tempdir().unwrap();
        write_marker(state.path(), &RestartMarker::new("fresh", "s-gone")).unwrap();

        assert_eq!(resume_after_restart(&r.controller, state.path()).as_deref(), Some("fresh"));
        r.controller.wait_idle("fresh").await;

        let hist = r.history("fresh").await;
        assert_eq!(hist[0].text(), RESUME_MESSAGE);
        assert_eq!(hist.last().unwrap().text(), "ok");
    }

    #[tokio::test]
    async fn nothing_to_resume_without_marker() {
        let r = rig(vec![], CompactionConfig::default());
        let state = tempfile::tempdir().unwrap();
        assert!(resume_after_restart(&r.controller, state.path()).is_none());
        assert!(r.controller.snapshot().is_empty());
    }
}
