//! Agent runtime: the turn engine, history repair, the per-route
//! concurrency controller, session compaction, tools, and restart
//! recovery.

pub mod compact;
pub mod controller;
pub mod repair;
pub mod restart;
pub mod tools;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

pub use compact::{CompactionReport, SessionLifecycle};
pub use controller::{CompactOutcome, Controller, OutputFn, RouteStatus, SourceMessage, SubmitOutcome};
pub use repair::repair;
pub use turn::{TurnEngine, TurnEvent};
