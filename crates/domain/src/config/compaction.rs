use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compaction replaces a large or long-idle session with a follow-on
/// session seeded by a generated summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Enable automatic compaction checks before and after turns.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Compact when session tokens + system prompt tokens reach this value.
    #[serde(default = "d_150000")]
    pub token_ceiling: u64,
    /// Idle time after which a session becomes eligible for compaction.
    #[serde(default = "d_720")]
    pub idle_lifespan_minutes: u64,
    /// Idle sessions smaller than this are left alone.
    #[serde(default = "d_20000")]
    pub idle_token_floor: u64,
    /// Tool results longer than this are shortened in the summarization
    /// prompt (the stored session is untouched).
    #[serde(default = "d_2000")]
    pub summary_tool_result_chars: usize,
    /// `max_tokens` for the summarization call.
    #[serde(default = "d_2000u")]
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_ceiling: d_150000(),
            idle_lifespan_minutes: d_720(),
            idle_token_floor: d_20000(),
            summary_tool_result_chars: d_2000(),
            summary_max_tokens: d_2000u(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_150000() -> u64 {
    150_000
}
fn d_720() -> u64 {
    720
}
fn d_20000() -> u64 {
    20_000
}
fn d_2000() -> usize {
    2000
}
fn d_2000u() -> u32 {
    2000
}
