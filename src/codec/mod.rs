//! Binary codec for checkpoint files.
//!
//! Provides:
//! - `RecordWriter`: Header + records + trailer, typed by a descriptor
//! - `RecordReader`: Iterator over records, typed by the caller's descriptor

mod binary;

pub use binary::*;
