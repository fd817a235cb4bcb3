use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Root for session logs, the route table, and the restart marker.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Working directory handed to tools.
    #[serde(default = "d_working_dir")]
    pub working_dir: PathBuf,
    /// Inline system prompt.  Ignored when `system_prompt_file` is set.
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
    /// File re-read before every model call, so edits apply mid-session.
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            working_dir: d_working_dir(),
            system_prompt: d_system_prompt(),
            system_prompt_file: None,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_working_dir() -> PathBuf {
    PathBuf::from(".")
}
fn d_system_prompt() -> String {
    "You are a helpful assistant with access to tools.".into()
}
