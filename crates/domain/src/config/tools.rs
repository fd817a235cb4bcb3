use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool results longer than this are truncated before entering history.
    #[serde(default = "d_30000")]
    pub max_result_chars: usize,
    /// Characters kept from the start of a truncated result.
    #[serde(default = "d_12000")]
    pub truncate_head_chars: usize,
    /// Characters kept from the end of a truncated result.
    #[serde(default = "d_12000")]
    pub truncate_tail_chars: usize,
    /// Maximum model round-trips in one turn.
    #[serde(default = "d_25")]
    pub max_tool_loops: usize,
    #[serde(default)]
    pub exec: ExecConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_result_chars: d_30000(),
            truncate_head_chars: d_12000(),
            truncate_tail_chars: d_12000(),
            max_tool_loops: d_25(),
            exec: ExecConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Hard timeout for one command.
    #[serde(default = "d_120")]
    pub timeout_sec: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_sec: d_120(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_30000() -> usize {
    30_000
}
fn d_12000() -> usize {
    12_000
}
fn d_25() -> usize {
    25
}
fn d_true() -> bool {
    true
}
fn d_120() -> u64 {
    120
}
