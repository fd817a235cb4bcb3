//! Shared types for the switchboard agent runtime.
//!
//! Everything that crosses a crate boundary lives here: the message model,
//! provider stream events, usage and cost accounting, the token/cost
//! estimator, configuration, and the domain error type.

pub mod config;
pub mod cost;
pub mod error;
pub mod estimate;
pub mod stream;
pub mod tool;
pub mod trace;
