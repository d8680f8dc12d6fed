//! Core data models for stagepoint.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Type descriptors and values with checked conformance
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants surfaced to the caller

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;
