//! Append-only JSONL session logs.
//!
//! Each session gets a `<session_id>.jsonl` file under the sessions
//! directory.  Every entry (the system prompt, then each message with its
//! optional cost) is one JSON line.
//!
//! Includes an in-memory write-through cache to avoid re-reading from disk
//! every turn, and runs file I/O on blocking threads to keep the tokio
//! runtime free.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::cost::MessageCost;
use sb_domain::error::{Error, Result};
use sb_domain::estimate::estimate_messages_tokens;
use sb_domain::tool::Message;
use sb_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    SystemPrompt {
        content: String,
        ts: DateTime<Utc>,
    },
    Message {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<MessageCost>,
        ts: DateTime<Utc>,
    },
}

impl SessionEntry {
    pub fn system_prompt(content: impl Into<String>) -> Self {
        Self::SystemPrompt {
            content: content.into(),
            ts: Utc::now(),
        }
    }

    pub fn message(message: Message, cost: Option<MessageCost>) -> Self {
        Self::Message {
            message,
            cost,
            ts: Utc::now(),
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::SystemPrompt { ts, .. } | Self::Message { ts, .. } => *ts,
        }
    }
}

/// The messages of a session log, in order.
pub fn messages_of(entries: &[SessionEntry]) -> Vec<Message> {
    entries
        .iter()
        .filter_map(|e| match e {
            SessionEntry::Message { message, .. } => Some(message.clone()),
            SessionEntry::SystemPrompt { .. } => None,
        })
        .collect()
}

/// Per-message costs recorded in a session log.
pub fn costs_of(entries: &[SessionEntry]) -> impl Iterator<Item = &MessageCost> {
    entries.iter().filter_map(|e| match e {
        SessionEntry::Message { cost, .. } => cost.as_ref(),
        SessionEntry::SystemPrompt { .. } => None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessageStore contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable, append-only storage of session entries.
///
/// Concurrent appends to different sessions are safe.  Writers to the same
/// session are serialized by the caller.  I/O errors are returned, never
/// retried.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// All entries of a session in append order.  Unknown sessions are empty.
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>>;

    async fn append(&self, session_id: &str, entry: SessionEntry) -> Result<()>;

    /// Replace the whole log of a session.
    async fn overwrite(&self, session_id: &str, entries: Vec<SessionEntry>) -> Result<()>;

    /// Timestamp of the newest entry, if any.
    async fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let entries = self.load(session_id).await?;
        Ok(entries.iter().map(SessionEntry::ts).max())
    }

    /// Heuristic token count of the session's messages.
    async fn estimated_token_count(&self, session_id: &str) -> Result<u64> {
        let entries = self.load(session_id).await?;
        Ok(estimate_messages_tokens(&messages_of(&entries)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSONL files with an in-memory write-through cache so reads never hit
/// disk after the first load.
pub struct JsonlMessageStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<SessionEntry>>>,
}

impl JsonlMessageStore {
    /// Store rooted at `base_dir` (created if missing).
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait::async_trait]
impl MessageStore for JsonlMessageStore {
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        let cached = self.cache.read().get(session_id).cloned();
        if let Some(entries) = cached {
            return Ok(entries);
        }

        let path = self.path_for(session_id);
        let sid = session_id.to_owned();
        let entries = tokio::task::spawn_blocking(move || read_jsonl_file(&path, &sid))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        self.cache
            .write()
            .insert(session_id.to_owned(), entries.clone());
        Ok(entries)
    }

    async fn append(&self, session_id: &str, entry: SessionEntry) -> Result<()> {
        let buf = serialize_entries(std::slice::from_ref(&entry))?;
        let path = self.path_for(session_id);

        // Disk first; the cache only sees entries that were written.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(buf.as_bytes())?;
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        // Only extend a cache that is already populated; otherwise the next
        // load reads the full file.
        if let Some(cached) = self.cache.write().get_mut(session_id) {
            cached.push(entry);
        }

        TraceEvent::StoreAppend {
            session_id: session_id.to_owned(),
            entries: 1,
        }
        .emit();
        Ok(())
    }

    async fn overwrite(&self, session_id: &str, entries: Vec<SessionEntry>) -> Result<()> {
        let buf = serialize_entries(&entries)?;
        let path = self.path_for(session_id);
        let count = entries.len();

        tokio::task::spawn_blocking(move || write_atomic(&path, buf.as_bytes()))
            .await
            .map_err(|e| Error::Other(format!("spawn_blocking join: {e}")))??;

        self.cache.write().insert(session_id.to_owned(), entries);

        TraceEvent::StoreOverwrite {
            session_id: session_id.to_owned(),
            entries: count,
        }
        .emit();
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Volatile store for one-shot runs and tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    sessions: RwLock<HashMap<String, Vec<SessionEntry>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, entry: SessionEntry) -> Result<()> {
        self.sessions
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn overwrite(&self, session_id: &str, entries: Vec<SessionEntry>) -> Result<()> {
        self.sessions
            .write()
            .insert(session_id.to_owned(), entries);
        Ok(())
    }
}

// ── Private helpers ───────────────────────────────────────────────

fn serialize_entries(entries: &[SessionEntry]) -> Result<String> {
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&serde_json::to_string(entry)?);
        buf.push('\n');
    }
    Ok(buf)
}

/// Write via a sibling temp file and rename, so readers never see a
/// half-written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_jsonl_file(path: &Path, session_id: &str) -> Result<Vec<SessionEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(
                    session_id = session_id,
                    error = %e,
                    "skipping malformed session log line"
                );
            }
        }
    }
    Ok(entries)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::cost::CostEstimate;
    use sb_domain::stream::Usage;
    use sb_domain::tool::ContentBlock;

    fn cost(input: u64) -> MessageCost {
        MessageCost {
            usage: Usage {
                input_tokens: input,
                ..Default::default()
            },
            cost: CostEstimate {
                optimistic: 0.01,
                pessimistic: 0.02,
            },
        }
    }

    #[test]
    fn entry_wire_shape() {
        let entry = SessionEntry::message(Message::user_text("hi"), None);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"]["role"], "user");
        assert!(json.get("cost").is_none());

        let sys = serde_json::to_value(SessionEntry::system_prompt("be nice")).unwrap();
        assert_eq!(sys["type"], "system_prompt");
        assert_eq!(sys["content"], "be nice");
    }

    #[tokio::test]
    async fn jsonl_roundtrip_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path()).unwrap();

        store
            .append("s1", SessionEntry::system_prompt("sys"))
            .await
            .unwrap();
        store
            .append("s1", SessionEntry::message(Message::user_text("hello"), None))
            .await
            .unwrap();
        store
            .append(
                "s1",
                SessionEntry::message(
                    Message::assistant(vec![ContentBlock::text("hi there")]),
                    Some(cost(100)),
                ),
            )
            .await
            .unwrap();

        let reopened = JsonlMessageStore::new(dir.path()).unwrap();
        let entries = reopened.load("s1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(messages_of(&entries).len(), 2);
        assert_eq!(costs_of(&entries).count(), 1);
        assert!(reopened.last_activity("s1").await.unwrap().is_some());
        assert!(reopened.estimated_token_count("s1").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn cache_tracks_appends_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path()).unwrap();
        assert!(store.load("s").await.unwrap().is_empty());

        store
            .append("s", SessionEntry::message(Message::user_text("a"), None))
            .await
            .unwrap();
        assert_eq!(store.load("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&SessionEntry::message(Message::user_text("ok"), None)).unwrap();
        std::fs::write(dir.path().join("s.jsonl"), format!("{good}\n{{not json\n\n{good}\n")).unwrap();

        let store = JsonlMessageStore::new(dir.path()).unwrap();
        assert_eq!(store.load("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overwrite_replaces_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path()).unwrap();
        for text in ["a", "b", "c"] {
            store
                .append("s", SessionEntry::message(Message::user_text(text), None))
                .await
                .unwrap();
        }
        store
            .overwrite("s", vec![SessionEntry::message(Message::user_text("z"), None)])
            .await
            .unwrap();

        let msgs = messages_of(&store.load("s").await.unwrap());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "z");

        // A fresh store reads the rewritten file from disk.
        let reopened = JsonlMessageStore::new(dir.path()).unwrap();
        let msgs = messages_of(&reopened.load("s").await.unwrap());
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "z");
    }

    #[tokio::test]
    async fn memory_store_empty_session() {
        let store = MemoryMessageStore::new();
        assert!(store.load("missing").await.unwrap().is_empty());
        assert_eq!(store.last_activity("missing").await.unwrap(), None);
        assert_eq!(store.estimated_token_count("missing").await.unwrap(), 0);
    }
}
