//! Usage and dollar-cost accounting.
//!
//! Costs are tracked per persisted assistant message ([`MessageCost`]) and
//! summed per session ([`SessionCostRecord`]).  The session record survives
//! compaction: the follow-on session starts from the predecessor's totals and
//! remembers the chain of session ids it descends from.

use serde::{Deserialize, Serialize};

use crate::stream::Usage;

/// A dollar estimate bracketed by cache-aware and cache-unaware pricing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub optimistic: f64,
    pub pessimistic: f64,
}

impl CostEstimate {
    pub fn add(&mut self, other: &CostEstimate) {
        self.optimistic += other.optimistic;
        self.pessimistic += other.pessimistic;
    }
}

/// Cost attached to a single persisted message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCost {
    pub usage: Usage,
    pub cost: CostEstimate,
}

/// Cumulative accounting for one session, including compacted predecessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCostRecord {
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub cost: CostEstimate,
    /// Ids of the sessions this one was compacted from, oldest first.
    #[serde(default)]
    pub previous_sessions: Vec<String>,
}

impl SessionCostRecord {
    pub fn record(&mut self, entry: &MessageCost) {
        self.usage.add(&entry.usage);
        self.cost.add(&entry.cost);
    }

    /// Build the record for a follow-on session: everything `self` knows,
    /// plus `extra` (the summarization call), with `old_session_id` appended
    /// to the chain.
    pub fn carry_forward(&self, old_session_id: &str, extra: &MessageCost) -> Self {
        let mut next = self.clone();
        next.record(extra);
        next.previous_sessions.push(old_session_id.to_owned());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_forward_extends_chain() {
        let mut rec = SessionCostRecord::default();
        rec.record(&MessageCost {
            usage: Usage {
                input_tokens: 5000,
                output_tokens: 2000,
                ..Default::default()
            },
            cost: CostEstimate {
                optimistic: 0.5,
                pessimistic: 0.5,
            },
        });

        let next = rec.carry_forward("s1", &MessageCost::default());
        assert_eq!(next.usage.input_tokens, 5000);
        assert_eq!(next.usage.output_tokens, 2000);
        assert!((next.cost.optimistic - 0.5).abs() < f64::EPSILON);
        assert_eq!(next.previous_sessions, vec!["s1".to_string()]);

        let third = next.carry_forward("s2", &MessageCost::default());
        assert_eq!(third.previous_sessions, vec!["s1".to_string(), "s2".to_string()]);
    }
}
