//! Compaction triggers: token ceiling and idle lifespan.
//!
//! Evaluated before a new message is admitted on a route and after every
//! turn.  The token trigger is unconditional; the idle trigger only fires
//! for sessions large enough to be worth a summarization call.

use chrono::{DateTime, Utc};

use sb_domain::config::CompactionConfig;

/// Why a session is due for compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactReason {
    TokenCeiling { tokens: u64 },
    Idle { idle_minutes: i64, tokens: u64 },
    Manual,
}

impl std::fmt::Display for CompactReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenCeiling { tokens } => write!(f, "token ceiling ({tokens} tokens)"),
            Self::Idle {
                idle_minutes,
                tokens,
            } => write!(f, "idle {idle_minutes}m ({tokens} tokens)"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Decide whether a session should be compacted.
///
/// `session_tokens` is the estimated size of the stored messages and
/// `system_prompt_tokens` the size of the prompt that would accompany them.
/// A session with no recorded activity is never idle.
pub fn should_compact(
    last_activity: Option<DateTime<Utc>>,
    session_tokens: u64,
    system_prompt_tokens: u64,
    now: DateTime<Utc>,
    config: &CompactionConfig,
) -> Option<CompactReason> {
    if !config.enabled {
        return None;
    }

    let tokens = session_tokens + system_prompt_tokens;
    if tokens >= config.token_ceiling {
        return Some(CompactReason::TokenCeiling { tokens });
    }

    let last = last_activity?;
    let idle_minutes = now.signed_duration_since(last).num_minutes();
    let lifespan = i64::try_from(config.idle_lifespan_minutes).unwrap_or(i64::MAX);
    if idle_minutes >= lifespan {
        if tokens >= config.idle_token_floor {
            return Some(CompactReason::Idle {
                idle_minutes,
                tokens,
            });
        }
        tracing::debug!(
            idle_minutes,
            tokens,
            floor = config.idle_token_floor,
            "idle session below token floor, not compacting"
        );
    }

    None
}
