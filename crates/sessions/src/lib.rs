//! Session persistence for switchboard.
//!
//! Sessions are append-only JSONL logs owned by a [`MessageStore`].  A route
//! (one conversation channel) points at exactly one current session through
//! the [`RouteStore`]; only session creation and compaction move that
//! pointer.  [`lifecycle`] decides when a session is due for compaction.

pub mod lifecycle;
pub mod store;
pub mod transcript;

pub use lifecycle::{should_compact, CompactReason};
pub use store::{RouteEntry, RouteStore};
pub use transcript::{
    costs_of, messages_of, JsonlMessageStore, MemoryMessageStore, MessageStore, SessionEntry,
};
