//! Typed checkpoint store.
//!
//! Epistemic foundation:
//! - K_i: One call is one job; shared ancestors of the N collections are
//!   computed once and all N files reflect the same execution
//! - K_i: A returned handle reads with the descriptor of the collection it
//!   replaces, never with one taken from the file
//! - B_i: Any stage, execution or publish failure → every file of the call is
//!   undone and no handle is returned
//! - I^B: Crash mid-call → pending transaction, undone by `recover`

use super::manifest::CheckpointManifest;
use super::transaction::{StagedEntry, Transaction};
use crate::codec::{ensure_serializable, RecordWriter};
use crate::dataflow::{Collection, Executor, Job, JobReport, LocalExecutor, RecordSink};
use crate::models::{CheckpointConfig, Config, Result, StagepointError, TypeDescriptor, Value, WritePolicy};
use crate::storage::{LocalStorage, Storage};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Destination of one checkpointed collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPath {
    pub path: PathBuf,
    pub policy: WritePolicy,
}

impl CheckpointPath {
    /// Path written with `WritePolicy::Overwrite`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_policy(path, WritePolicy::Overwrite)
    }

    pub fn with_policy(path: impl Into<PathBuf>, policy: WritePolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }
}

impl From<&str> for CheckpointPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for CheckpointPath {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for CheckpointPath {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

/// Sink encoding one collection into a staged checkpoint file.
struct CheckpointSink {
    target: PathBuf,
    writer: RecordWriter<Box<dyn Write + Send>>,
}

/// IO failures while writing a checkpoint are storage failures of its path.
fn storage_error(target: &Path, error: StagepointError) -> StagepointError {
    match error {
        StagepointError::Io { source, .. } => StagepointError::storage_write(target, source),
        other => other,
    }
}

impl RecordSink for CheckpointSink {
    fn write(&mut self, record: &Value) -> Result<()> {
        self.writer
            .write(record)
            .map_err(|e| storage_error(&self.target, e))
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let CheckpointSink { target, writer } = *self;
        writer.finish().map_err(|e| storage_error(&target, e))
    }
}

/// Undo the files of a transaction: put back what was overwritten, remove
/// what was newly published, discard what was only staged.
fn undo_entries(storage: &dyn Storage, staging_id: &str, entries: &[StagedEntry]) -> Result<()> {
    for entry in entries.iter().rev() {
        if !entry.published {
            storage.discard(&entry.path, staging_id)?;
        }
        // A backup can exist for an unpublished entry if a crash hit mid-publish
        let restored = storage.restore(&entry.path, staging_id)?;
        if entry.published && !restored {
            storage.remove(&entry.path)?;
        }
    }
    Ok(())
}

/// Drop the backups of a committed transaction. The data is already
/// published, so failures are only logged.
fn drop_backups(storage: &dyn Storage, staging_id: &str, entries: &[StagedEntry]) {
    for entry in entries {
        if let Err(e) = storage.drop_backup(&entry.path, staging_id) {
            warn!(path = %entry.path.display(), error = %e, "Failed to remove backup");
        }
    }
}

/// Materializes collections to storage and hands back handles that read them.
#[derive(Debug)]
pub struct CheckpointStore {
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    config: CheckpointConfig,
    state_dir: PathBuf,
    default_policy: WritePolicy,
}

impl CheckpointStore {
    /// Create a store, creating its state directory under the storage root.
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: Arc<dyn Executor>,
        config: CheckpointConfig,
    ) -> Result<Self> {
        let state_dir = storage.resolve(&config.state_dir);
        fs::create_dir_all(&state_dir)
            .map_err(|e| StagepointError::io("creating checkpoint state directory", e))?;
        Ok(Self {
            storage,
            executor,
            config,
            state_dir,
            default_policy: WritePolicy::Overwrite,
        })
    }

    /// Local filesystem store and in-process executor, as configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let storage = LocalStorage::new(&config.storage.resolved_root())?;
        let store = Self::new(
            Arc::new(storage),
            Arc::new(LocalExecutor::new()),
            config.checkpoint.clone(),
        )?;
        Ok(store.with_default_policy(config.storage.default_policy))
    }

    /// Policy used by `path`.
    pub fn with_default_policy(mut self, policy: WritePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// A checkpoint path using this store's default policy.
    pub fn path(&self, path: impl Into<PathBuf>) -> CheckpointPath {
        CheckpointPath::with_policy(path, self.default_policy)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Write every collection to its path in a single job and return
    /// handles reading the written files, in input order.
    ///
    /// All-or-nothing: on failure every path of this call holds what it held
    /// before and no handle is returned.
    pub fn checkpoint(
        &self,
        collections: Vec<Collection>,
        paths: Vec<CheckpointPath>,
    ) -> Result<Vec<Collection>> {
        self.validate(&collections, &paths)?;

        let mut tx = Transaction::begin(&self.state_dir)?;
        info!(
            tx_id = %tx.id(),
            collections = collections.len(),
            "Checkpoint started"
        );

        let report = match self.write_all(&mut tx, &collections, &paths) {
            Ok(report) => report,
            Err(e) => {
                warn!(tx_id = %tx.id(), error = %e, "Checkpoint failed, rolling back");
                self.rollback(tx);
                return Err(e);
            }
        };

        let tx_id = tx.id().to_string();
        let entries = tx.entries().to_vec();
        if let Err(e) = tx.commit() {
            warn!(tx_id = %tx_id, error = %e, "Checkpoint commit failed, rolling back");
            if let Err(undo) = undo_entries(self.storage.as_ref(), &tx_id, &entries) {
                warn!(tx_id = %tx_id, error = %undo, "Rollback incomplete, run recover");
            }
            return Err(e);
        }
        drop_backups(self.storage.as_ref(), &tx_id, &entries);

        info!(
            tx_id = %tx_id,
            job_id = %report.job_id,
            records = report.records_written.iter().sum::<u64>(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Checkpoint complete"
        );

        Ok(collections
            .into_iter()
            .zip(paths)
            .map(|(collection, target)| {
                Collection::from_checkpoint(
                    Arc::clone(&self.storage),
                    target.path,
                    collection.descriptor().clone(),
                )
            })
            .collect())
    }

    /// Checkpoint a single collection.
    pub fn checkpoint_one(
        &self,
        collection: Collection,
        path: impl Into<CheckpointPath>,
    ) -> Result<Collection> {
        self.checkpoint(vec![collection], vec![path.into()])?
            .pop()
            .ok_or_else(|| StagepointError::Internal("checkpoint returned no handle".to_string()))
    }

    /// Checkpoint a fixed number of collections, keeping the arity in the type.
    pub fn checkpoint_array<const N: usize>(
        &self,
        collections: [Collection; N],
        paths: [CheckpointPath; N],
    ) -> Result<[Collection; N]> {
        let handles = self.checkpoint(Vec::from(collections), Vec::from(paths))?;
        <[Collection; N]>::try_from(handles).map_err(|v| {
            StagepointError::Internal(format!("expected {N} handles, got {}", v.len()))
        })
    }

    /// Handle reading an existing checkpoint with the given descriptor.
    pub fn open(&self, path: impl Into<PathBuf>, descriptor: TypeDescriptor) -> Collection {
        Collection::from_checkpoint(Arc::clone(&self.storage), path, descriptor)
    }

    /// Sidecar manifest of the checkpoint at `path`, if present.
    pub fn manifest(&self, path: &Path) -> Result<Option<CheckpointManifest>> {
        CheckpointManifest::load(self.storage.as_ref(), path)
    }

    /// Undo checkpoint calls interrupted by a crash.
    ///
    /// Returns the number of interrupted calls undone.
    pub fn recover(&self) -> Result<usize> {
        let storage = Arc::clone(&self.storage);
        let undone = Transaction::recover(&self.state_dir, |state| {
            undo_entries(storage.as_ref(), &state.id, &state.entries)
        })?;
        if undone > 0 {
            info!(transactions = undone, "Recovered interrupted checkpoints");
        }
        Ok(undone)
    }

    fn validate(&self, collections: &[Collection], paths: &[CheckpointPath]) -> Result<()> {
        if collections.is_empty() {
            return Err(StagepointError::InvalidInput(
                "checkpoint needs at least one collection".to_string(),
            ));
        }
        if collections.len() != paths.len() {
            return Err(StagepointError::InvalidInput(format!(
                "{} collections but {} paths",
                collections.len(),
                paths.len()
            )));
        }

        // Data files and their manifests must not land on each other
        let mut claimed = HashSet::with_capacity(paths.len() * 2);
        for (collection, target) in collections.iter().zip(paths) {
            let resolved = self.storage.resolve(&target.path);
            if !claimed.insert(resolved.clone()) {
                return Err(StagepointError::InvalidInput(format!(
                    "path {} appears more than once or is another path's manifest",
                    resolved.display()
                )));
            }
            if self.config.write_manifest {
                let sidecar = self
                    .storage
                    .resolve(&CheckpointManifest::sidecar_path(&target.path));
                if !claimed.insert(sidecar.clone()) {
                    return Err(StagepointError::InvalidInput(format!(
                        "manifest {} of {} collides with another checkpoint path",
                        sidecar.display(),
                        resolved.display()
                    )));
                }
            }
            ensure_serializable(collection.descriptor())?;
            self.storage.check_writable(&target.path, target.policy)?;
        }
        Ok(())
    }

    fn write_all(
        &self,
        tx: &mut Transaction,
        collections: &[Collection],
        paths: &[CheckpointPath],
    ) -> Result<JobReport> {
        let staging_id = tx.id().to_string();

        let mut job = Job::new();
        for (collection, target) in collections.iter().zip(paths) {
            tx.record_staged(&target.path, target.policy)?;
            let resolved = self.storage.resolve(&target.path);
            let out = self.storage.stage(&target.path, &staging_id)?;
            let writer = RecordWriter::new(out, collection.descriptor().clone())
                .map_err(|e| storage_error(&resolved, e))?;
            job.add_sink(
                collection.clone(),
                Box::new(CheckpointSink {
                    target: resolved,
                    writer,
                }),
            );
        }

        let report = self.executor.execute(job)?;

        if self.config.write_manifest {
            for ((collection, target), records) in collections
                .iter()
                .zip(paths)
                .zip(&report.records_written)
            {
                let sidecar = CheckpointManifest::sidecar_path(&target.path);
                let manifest = CheckpointManifest::new(
                    collection.descriptor().clone(),
                    *records,
                    report.job_id,
                );
                tx.record_staged(&sidecar, WritePolicy::Overwrite)?;
                let mut out = self.storage.stage(&sidecar, &staging_id)?;
                out.write_all(manifest.to_json()?.as_bytes())
                    .and_then(|()| out.flush())
                    .map_err(|e| StagepointError::storage_write(&self.storage.resolve(&sidecar), e))?;
            }
        }

        let entries = tx.entries().to_vec();
        for entry in &entries {
            self.storage
                .publish(&entry.path, &staging_id, entry.policy)?;
            tx.mark_published(&entry.path)?;
            debug!(path = %entry.path.display(), "Checkpoint file published");
        }

        Ok(report)
    }

    fn rollback(&self, tx: Transaction) {
        let undone = undo_entries(self.storage.as_ref(), tx.id(), tx.entries());
        match undone {
            Ok(()) => {
                if let Err(e) = tx.abort() {
                    warn!(error = %e, "Failed to remove pending transaction after rollback");
                }
            }
            // The transaction stays pending so `recover` can finish the job
            Err(e) => warn!(tx_id = %tx.id(), error = %e, "Rollback incomplete, run recover"),
        }
    }
}
