//! Checkpoint store for typed intermediate results.
//!
//! Provides:
//! - `CheckpointStore`: All-or-nothing materialization of collections in one job
//! - `CheckpointManifest`: `<path>.meta.json` sidecar describing a checkpoint
//! - `Transaction`: Intent log with crash recovery

mod manifest;
mod store;
mod transaction;

pub use manifest::*;
pub use store::*;
pub use transaction::*;
