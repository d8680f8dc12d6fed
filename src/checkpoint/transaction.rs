//! Checkpoint write transactions.
//!
//! Epistemic foundation:
//! - K_i: Every staged file is recorded in the intent file before it is created
//! - K_i: Uses write-ahead pattern: record intent → stage → publish → commit
//! - B_i: Partial failure → caller rolls back every recorded entry
//! - I^B: Crash during transaction → recovery via pending transaction file

use crate::models::{Result, StagepointError, WritePolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// One file written by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Storage path the file is published to
    pub path: PathBuf,
    pub policy: WritePolicy,
    /// Whether the staged file has been published to `path`
    #[serde(default)]
    pub published: bool,
}

/// Transaction state persisted to disk for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionState {
    /// Unique transaction ID, also the staging ID of every entry
    pub id: String,
    pub entries: Vec<StagedEntry>,
    /// Whether transaction was committed
    pub committed: bool,
    /// Timestamp when transaction started
    pub started_at: DateTime<Utc>,
}

/// Intent log for one checkpoint call.
///
/// If the process dies before `commit` or `abort`, the pending file tells
/// `recover` which staged and published files belong to the failed call.
pub struct Transaction {
    id: String,
    pending_path: PathBuf,
    entries: Vec<StagedEntry>,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl Transaction {
    /// Begin a new transaction, writing its pending file into `state_dir`.
    pub fn begin(state_dir: &Path) -> Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!(
            "tx_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S_%3f"),
            &suffix[..8]
        );
        let pending_path = state_dir.join(format!("{id}.pending.json"));

        let tx = Self {
            id: id.clone(),
            pending_path,
            entries: Vec::new(),
            started_at: Utc::now(),
            finished: false,
        };
        tx.persist_state(false)?;

        debug!(tx_id = %id, "Transaction started");
        Ok(tx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entries(&self) -> &[StagedEntry] {
        &self.entries
    }

    /// Record that a file for `path` is about to be staged.
    pub fn record_staged(&mut self, path: &Path, policy: WritePolicy) -> Result<()> {
        self.entries.push(StagedEntry {
            path: path.to_path_buf(),
            policy,
            published: false,
        });
        self.persist_state(false)
    }

    /// Record that the staged file for `path` is now visible.
    pub fn mark_published(&mut self, path: &Path) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| {
                StagepointError::Internal(format!(
                    "{} was published but never staged",
                    path.display()
                ))
            })?;
        entry.published = true;
        self.persist_state(false)
    }

    /// Commit the transaction and remove its pending file.
    pub fn commit(mut self) -> Result<()> {
        if self.finished {
            return Err(StagepointError::Internal(
                "Transaction already finished".to_string(),
            ));
        }

        self.persist_state(true)?;
        self.remove_pending()?;

        self.finished = true;
        debug!(tx_id = %self.id, entries = self.entries.len(), "Transaction committed");
        Ok(())
    }

    /// Abort the transaction. The caller is responsible for having undone
    /// its entries.
    pub fn abort(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.remove_pending()?;
        self.finished = true;
        debug!(tx_id = %self.id, "Transaction aborted");
        Ok(())
    }

    /// Find pending transactions in `state_dir` and hand each uncommitted one
    /// to `undo`. A pending file is removed only once `undo` succeeds for it.
    ///
    /// Returns the number of uncommitted transactions undone.
    pub fn recover<F>(state_dir: &Path, mut undo: F) -> Result<usize>
    where
        F: FnMut(&TransactionState) -> Result<()>,
    {
        let pattern = state_dir.join("tx_*.pending.json");
        let pattern_str = pattern.to_string_lossy();

        let pending_files: Vec<_> = glob::glob(&pattern_str)
            .map_err(|e| StagepointError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut undone = 0;
        for pending_path in pending_files {
            warn!(path = %pending_path.display(), "Found pending transaction, recovering");

            let content = fs::read_to_string(&pending_path)
                .map_err(|e| StagepointError::io("reading pending transaction", e))?;
            let state: TransactionState = serde_json::from_str(&content).map_err(|e| {
                StagepointError::Corrupt(format!("Invalid transaction state: {e}"))
            })?;

            if state.committed {
                // Committed, but the pending file outlived the commit
                debug!(tx_id = %state.id, "Transaction was committed, cleaning up");
            } else {
                warn!(
                    tx_id = %state.id,
                    entries = state.entries.len(),
                    "Transaction was not committed, undoing"
                );
                undo(&state)?;
                undone += 1;
            }

            fs::remove_file(&pending_path)
                .map_err(|e| StagepointError::io("removing pending transaction", e))?;
        }

        Ok(undone)
    }

    fn remove_pending(&self) -> Result<()> {
        if self.pending_path.exists() {
            fs::remove_file(&self.pending_path)
                .map_err(|e| StagepointError::io("removing pending transaction", e))?;
        }
        Ok(())
    }

    /// Persist current transaction state to disk (write-then-rename).
    fn persist_state(&self, committed: bool) -> Result<()> {
        let state = TransactionState {
            id: self.id.clone(),
            entries: self.entries.clone(),
            committed,
            started_at: self.started_at,
        };

        let content = serde_json::to_string_pretty(&state)
            .map_err(|e| StagepointError::Internal(format!("Serializing transaction: {e}")))?;

        let temp_path = self.pending_path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .map_err(|e| StagepointError::io("writing pending transaction", e))?;
        fs::rename(&temp_path, &self.pending_path)
            .map_err(|e| StagepointError::io("renaming pending transaction", e))?;

        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                tx_id = %self.id,
                entries = self.entries.len(),
                "Transaction dropped without commit/abort - will be recovered on restart"
            );
        }
    }
}
