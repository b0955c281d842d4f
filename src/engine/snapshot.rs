//! Engine snapshots
//!
//! A snapshot captures the whole loop tree (suspensions included) so a run
//! can be stopped and restored in another process. Instances that were in
//! flight are saved as `running` and are dispatched again after a restore.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Configuration;
use crate::domain::LoopInstance;
use crate::error::{EngineError, Result};
use crate::id::InstanceId;
use crate::tree::LoopTree;

/// Serialized form of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub format_version: u32,
    pub run_id: String,
    /// Configuration version the run was using
    pub config_version: u64,
    pub saved_at: DateTime<Utc>,
    pub root: Option<InstanceId>,
    pub next_id: u64,
    pub instances: Vec<LoopInstance>,
}

impl EngineSnapshot {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn capture(run_id: &str, tree: &LoopTree) -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            run_id: run_id.to_string(),
            config_version: tree.config().version(),
            saved_at: Utc::now(),
            root: tree.root(),
            next_id: tree.next_id(),
            instances: tree.instances().cloned().collect(),
        }
    }

    pub fn instance(&self, id: InstanceId) -> Option<&LoopInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Rebuild the tree against `config`, which may not be older than the
    /// configuration the snapshot was taken with.
    pub fn into_tree(self, config: std::sync::Arc<Configuration>) -> Result<LoopTree> {
        if self.format_version != Self::FORMAT_VERSION {
            return Err(EngineError::invalid(format!(
                "snapshot format {} is not supported (expected {})",
                self.format_version,
                Self::FORMAT_VERSION
            )));
        }
        if config.version() < self.config_version {
            return Err(EngineError::config(format!(
                "snapshot needs configuration v{} or later, got v{}",
                self.config_version,
                config.version()
            )));
        }
        LoopTree::from_parts(config, self.root, self.next_id, self.instances)
    }
}

/// Snapshot file on disk
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write to a temp file next to the target, then rename over it
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("Saved snapshot of {} to {}", snapshot.run_id, self.path.display());
        Ok(())
    }

    /// Load the snapshot, or None if there is none yet
    pub fn load(&self) -> Result<Option<EngineSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
