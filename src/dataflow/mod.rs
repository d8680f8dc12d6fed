//! Dataflow collections and their execution.
//!
//! Provides:
//! - `Collection`: Typed collection handle over a plan of transformations
//! - `Executor` / `LocalExecutor`: Runs a `Job` of sinks as one coordinated pass
//! - `RecordSink`: Destination attached to a collection within a job

mod engine;
mod graph;

pub use engine::*;
pub use graph::*;
