//! File-based event log for work package and feature aggregates.
//!
//! This module provides the append-only JSONL log that every other
//! component reads from; nothing else writes event files.

pub mod file_store;

pub use file_store::{AppendOutcome, BatchOutcome, FileEventLog};
