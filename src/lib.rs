//! Event-sourced status and sync engine for work packages and features.
//!
//! Local actions become envelopes stamped by a Lamport clock, appended to a
//! per-aggregate JSONL log and queued for the remote authority. Status is
//! always folded from the merged log; the log is the only source of truth.

pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod enrichment;
pub mod envelope;
pub mod event_store;
pub mod merge;
pub mod paths;
pub mod reducer;
pub mod structured_logger;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{EmitOutcome, StatusEngine};
