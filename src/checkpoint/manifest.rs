//! Checkpoint sidecar manifests.
//!
//! Epistemic foundation:
//! - K_i: The manifest describes a checkpoint; readers never take their
//!   record type from it
//! - B_i: Sidecar may be missing (manifests disabled) → Option

use crate::codec::FORMAT_VERSION;
use crate::models::{Result, StagepointError, TypeDescriptor};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SIDECAR_SUFFIX: &str = ".meta.json";

/// Metadata written next to a checkpoint at `<path>.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Binary format version of the data file
    pub format_version: u8,
    /// Descriptor the data was written with
    pub descriptor: TypeDescriptor,
    /// Fingerprint of `descriptor`, as stored in the data header
    pub fingerprint: String,
    /// Number of records in the data file
    pub records: u64,
    /// Job that produced the checkpoint
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl CheckpointManifest {
    pub fn new(descriptor: TypeDescriptor, records: u64, job_id: Uuid) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            fingerprint: format!("{:016x}", descriptor.fingerprint()),
            descriptor,
            records,
            job_id,
            created_at: Utc::now(),
        }
    }

    /// Sidecar location for a checkpoint path.
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StagepointError::Internal(format!("Serializing manifest: {e}")))
    }

    /// Load the manifest for the checkpoint at `path`, if one was written.
    pub fn load(storage: &dyn Storage, path: &Path) -> Result<Option<Self>> {
        let sidecar = Self::sidecar_path(path);
        if !storage.exists(&sidecar) {
            return Ok(None);
        }
        let mut content = String::new();
        storage
            .open(&sidecar)?
            .read_to_string(&mut content)
            .map_err(|e| StagepointError::io("reading manifest", e))?;
        let manifest = serde_json::from_str(&content)
            .map_err(|e| StagepointError::Corrupt(format!("Invalid manifest: {e}")))?;
        Ok(Some(manifest))
    }
}
