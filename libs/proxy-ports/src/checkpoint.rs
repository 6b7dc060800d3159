//! Durable checkpoint of the proxy port registry.
//!
//! The registry is serialized to a JSON file in the agent's state
//! directory so allocations survive a restart. Writes go through the
//! write-to-temp + rename pattern so a crash mid-write never leaves a
//! partial file. On restore, a `written_at` stamp bounds how old a
//! checkpoint may be trusted; anything older is treated as "nothing to
//! restore" since it likely no longer matches live datapath state.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::ProxyType;

/// Checkpoint file format version.
const CHECKPOINT_VERSION: u32 = 1;

/// File name within the state directory.
pub const CHECKPOINT_FILENAME: &str = "proxy_ports_state.json";

/// On-disk shape of the checkpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Format version.
    pub version: u32,
    /// When the checkpoint was written; compared against the restore
    /// age limit.
    pub written_at: DateTime<Utc>,
    /// All registry records, ordered by listener name.
    pub ports: Vec<ProxyPortRecord>,
}

/// One serialized [`crate::ProxyPort`] record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPortRecord {
    pub proxy_type: ProxyType,
    pub name: String,
    pub ingress: bool,
    pub port: u16,
    pub configured: bool,
    pub is_static: bool,
    pub n_redirects: u64,
    pub rules_port: u16,
}

/// Reads and writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at the agent's state directory.
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join(CHECKPOINT_FILENAME),
        }
    }

    /// Write all records atomically.
    pub fn save(&self, records: &[ProxyPortRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = CheckpointFile {
            version: CHECKPOINT_VERSION,
            written_at: Utc::now(),
            ports: records.to_vec(),
        };

        let tmp_path = self.path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(&file).context("Failed to serialize checkpoint")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        debug!(
            path = %self.path.display(),
            ports = records.len(),
            "Wrote proxy ports checkpoint"
        );

        Ok(())
    }

    /// Load records from disk.
    ///
    /// Returns an empty list when there is no file, when the format
    /// version is unknown, or when the checkpoint is older than
    /// `age_limit`; none of these are errors.
    pub fn load(&self, age_limit: Duration) -> Result<Vec<ProxyPortRecord>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No proxy ports checkpoint, starting fresh");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint: {}", self.path.display()))?;

        let file: CheckpointFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", self.path.display()))?;

        if file.version != CHECKPOINT_VERSION {
            warn!(
                file_version = file.version,
                current_version = CHECKPOINT_VERSION,
                "Checkpoint version mismatch, starting fresh"
            );
            return Ok(Vec::new());
        }

        let age = Utc::now().signed_duration_since(file.written_at);
        let limit = chrono::Duration::from_std(age_limit).unwrap_or(chrono::Duration::MAX);
        if age > limit {
            info!(
                path = %self.path.display(),
                age_secs = age.num_seconds(),
                limit_secs = limit.num_seconds(),
                "Ignoring stale proxy ports checkpoint"
            );
            return Ok(Vec::new());
        }

        info!(
            path = %self.path.display(),
            ports = file.ports.len(),
            "Loaded proxy ports checkpoint"
        );

        Ok(file.ports)
    }
}
