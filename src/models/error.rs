//! Error types for stagepoint.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad input, type mismatch, malformed expressions)
//! - I^B materialized: Infrastructure failures (storage, execution)
//! - K_i violated: Internal invariant violations (bugs)

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level error type for stagepoint.
#[derive(Debug, Error)]
pub enum StagepointError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Code generation failed: {0}")]
    CodeGeneration(String),

    #[error("Corrupt checkpoint data: {0}")]
    Corrupt(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Storage write failed for {path}: {reason}")]
    StorageWrite { path: PathBuf, reason: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagepointError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a storage write failure for a path.
    pub fn storage_write(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::StorageWrite {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Check if the caller may reasonably retry the failed call.
    ///
    /// Type and code generation failures are deterministic: retrying the same
    /// request fails the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageWrite { .. } | Self::Execution(_) | Self::Io { .. }
        )
    }
}

/// Result type alias for stagepoint.
pub type Result<T> = std::result::Result<T, StagepointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StagepointError::Execution("oom".into()).is_retryable());
        assert!(StagepointError::storage_write(Path::new("/x"), "denied").is_retryable());
        assert!(!StagepointError::TypeMismatch("opaque".into()).is_retryable());
        assert!(!StagepointError::CodeGeneration("unknown field".into()).is_retryable());
    }

    #[test]
    fn test_storage_write_message_names_path() {
        let err = StagepointError::storage_write(Path::new("/data/out.bin"), "already exists");
        assert_eq!(
            err.to_string(),
            "Storage write failed for /data/out.bin: already exists"
        );
    }
}
