//! Route → session pointer store.
//!
//! Persists the route table in `routes.json` under the sessions directory.
//! Each route maps to a [`RouteEntry`] naming its current session and the
//! cumulative cost record that survives compaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::cost::{MessageCost, SessionCostRecord};
use sb_domain::error::Result;
use sb_domain::trace::TraceEvent;

use crate::transcript::write_atomic;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The current session of one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub route: String,
    pub session_id: String,
    /// When the current session was created.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cost: SessionCostRecord,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Route table backed by a JSON file, flushed after every mutation.
pub struct RouteStore {
    routes_path: PathBuf,
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl RouteStore {
    /// Load or create the route table at `state_path/sessions/routes.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir)?;

        let routes_path = dir.join("routes.json");
        let routes = if routes_path.exists() {
            let raw = std::fs::read_to_string(&routes_path)?;
            match serde_json::from_str(&raw) {
                Ok(routes) => routes,
                Err(e) => {
                    tracing::warn!(
                        path = %routes_path.display(),
                        error = %e,
                        "route table unreadable, starting empty"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        tracing::info!(
            routes = routes.len(),
            path = %routes_path.display(),
            "route store loaded"
        );

        Ok(Self {
            routes_path,
            routes: RwLock::new(routes),
        })
    }

    /// Directory holding the session logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.routes_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf()
    }

    pub fn get(&self, route: &str) -> Option<RouteEntry> {
        self.routes.read().get(route).cloned()
    }

    /// The route whose current session is `session_id`.
    pub fn find_by_session(&self, session_id: &str) -> Option<RouteEntry> {
        self.routes
            .read()
            .values()
            .find(|e| e.session_id == session_id)
            .cloned()
    }

    /// Resolve or create the current session for a route.  Returns
    /// `(entry, is_new)`.
    pub fn resolve_or_create(&self, route: &str) -> (RouteEntry, bool) {
        if let Some(entry) = self.get(route) {
            return (entry, false);
        }

        let entry = {
            let mut routes = self.routes.write();
            // Another caller may have created it between the two locks.
            if let Some(entry) = routes.get(route) {
                return (entry.clone(), false);
            }
            let now = Utc::now();
            let entry = RouteEntry {
                route: route.to_owned(),
                session_id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                cost: SessionCostRecord::default(),
            };
            routes.insert(route.to_owned(), entry.clone());
            entry
        };

        TraceEvent::SessionCreated {
            route: route.to_owned(),
            session_id: entry.session_id.clone(),
        }
        .emit();
        self.persist();

        (entry, true)
    }

    /// Point `route` at `new_session_id` with the given cost record.
    /// Returns the entry that was replaced, if any.
    pub fn replace_session(
        &self,
        route: &str,
        new_session_id: &str,
        cost: SessionCostRecord,
    ) -> Option<RouteEntry> {
        let now = Utc::now();
        let new_entry = RouteEntry {
            route: route.to_owned(),
            session_id: new_session_id.to_owned(),
            created_at: now,
            updated_at: now,
            cost,
        };
        let old = self.routes.write().insert(route.to_owned(), new_entry);
        self.persist();
        old
    }

    /// Add one message's cost to the route's cumulative record.
    pub fn record_cost(&self, route: &str, cost: &MessageCost) {
        {
            let mut routes = self.routes.write();
            let Some(entry) = routes.get_mut(route) else {
                return;
            };
            entry.cost.record(cost);
            entry.updated_at = Utc::now();
        }
        self.persist();
    }

    /// Touch the updated_at timestamp.
    pub fn touch(&self, route: &str) {
        {
            let mut routes = self.routes.write();
            let Some(entry) = routes.get_mut(route) else {
                return;
            };
            entry.updated_at = Utc::now();
        }
        self.persist();
    }

    /// All route entries, sorted by route.
    pub fn list(&self) -> Vec<RouteEntry> {
        let mut entries: Vec<RouteEntry> = self.routes.read().values().cloned().collect();
        entries.sort_by(|a, b| a.route.cmp(&b.route));
        entries
    }

    /// Persist the current route table to disk.
    pub fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.routes.read())?;
        write_atomic(&self.routes_path, json.as_bytes())
    }

    fn persist(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!(
                path = %self.routes_path.display(),
                error = %e,
                "failed to flush route table"
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::cost::CostEstimate;
    use sb_domain::stream::Usage;

    #[test]
    fn resolve_is_stable_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path()).unwrap();

        let (first, is_new) = store.resolve_or_create("discord:general");
        assert!(is_new);
        let (again, is_new) = store.resolve_or_create("discord:general");
        assert!(!is_new);
        assert_eq!(first.session_id, again.session_id);

        let reopened = RouteStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened.get("discord:general").map(|e| e.session_id),
            Some(first.session_id)
        );
    }

    #[test]
    fn replace_moves_pointer_and_keeps_old() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path()).unwrap();
        let (entry, _) = store.resolve_or_create("r");

        let carried = SessionCostRecord {
            previous_sessions: vec![entry.session_id.clone()],
            ..Default::default()
        };
        let old = store.replace_session("r", "s-next", carried).unwrap();
        assert_eq!(old.session_id, entry.session_id);

        let now = store.get("r").unwrap();
        assert_eq!(now.session_id, "s-next");
        assert_eq!(now.cost.previous_sessions, vec![entry.session_id]);
        assert!(store.find_by_session("s-next").is_some());
    }

    #[test]
    fn costs_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::new(dir.path()).unwrap();
        store.resolve_or_create("r");
        let mc = MessageCost {
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            cost: CostEstimate {
                optimistic: 0.1,
                pessimistic: 0.2,
            },
        };
        store.record_cost("r", &mc);
        store.record_cost("r", &mc);
        store.record_cost("unknown", &mc);

        let entry = store.get("r").unwrap();
        assert_eq!(entry.cost.usage.input_tokens, 20);
        assert!((entry.cost.cost.pessimistic - 0.4).abs() < 1e-9);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn corrupt_table_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sessions")).unwrap();
        std::fs::write(dir.path().join("sessions/routes.json"), "{oops").unwrap();
        let store = RouteStore::new(dir.path()).unwrap();
        assert!(store.list().is_empty());
    }
}
