//! LLM backends for switchboard.
//!
//! The runtime only sees [`LlmProvider`]; adapters translate to and from a
//! vendor wire format.  [`ProviderRegistry`] builds adapters from config and
//! resolves them by role.

pub mod anthropic;
pub mod registry;
pub mod traits;
pub(crate) mod sse;
pub(crate) mod util;

// Re-exports for convenience.
pub use registry::{ProviderRegistry, ROLE_EXECUTOR, ROLE_SUMMARIZER};
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
