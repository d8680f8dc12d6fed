//! Storage module for checkpoint bytes.
//!
//! Provides:
//! - `Storage`: Path-addressed staged write / sequential read contract
//! - `LocalStorage`: Local filesystem implementation

mod local;

pub use local::*;
