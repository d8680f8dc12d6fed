//! stagepoint - Typed checkpoint store and generated record assemblers.
//!
//! ## Architecture
//!
//! stagepoint has two cooperating components:
//! - **Checkpoint Store**: Writes N typed collections in one coordinated job,
//!   all-or-nothing, and hands back handles that re-read them
//! - **Assembler Generator**: Turns declarative field expressions into a
//!   type-checked, reusable function that fills output record builders
//!
//! ## Collaborators
//!
//! - `storage`: Path-addressed staged writes (local filesystem)
//! - `dataflow`: Collection handles and a single-pass executor
//! - `codec`: Type-directed binary serialization without stored schema
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Descriptors and structural types checked before data flows
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Storage and execution failures, undone or recovered

pub mod assembler;
pub mod checkpoint;
pub mod codec;
pub mod dataflow;
pub mod models;
pub mod storage;

// Re-exports for convenience
pub use assembler::{col, lit, Assembler, AssemblerGenerator, Expr, FieldExpr, RecordBuilder, TypeContext};
pub use checkpoint::{CheckpointManifest, CheckpointPath, CheckpointStore};
pub use dataflow::{Collection, Executor, LocalExecutor};
pub use models::{Config, DataType, Result, StagepointError, TypeDescriptor, Value, WritePolicy};
pub use storage::{LocalStorage, Storage};
