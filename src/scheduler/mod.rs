//! Poll scheduler
//!
//! Drives periodic, per-pair concurrent fetches against the active rate
//! source and writes successes into the metric registry.

mod poller;

pub use poller::{PollScheduler, TickReport};
