use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::operations::{Operation, OperationStatus};
use super::resource::{ResourceDescriptor, ResourceStatus};

const STATE_VERSION: u32 = 1;
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Resource table keyed by id plus operation table keyed by operation id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub resources: Vec<ResourceDescriptor>,
    pub operations: Vec<Operation>,
}

impl PersistedState {
    #[must_use]
    pub fn new(resources: Vec<ResourceDescriptor>, operations: Vec<Operation>) -> Self {
        Self {
            version: STATE_VERSION,
            resources,
            operations,
        }
    }

    /// Makes a state written by a process that died mid-operation consistent
    /// again: running operations fail and transitional resources fall back to
    /// where they were before the operation started. Returns how many
    /// operations were interrupted.
    pub fn recover(&mut self, now: OffsetDateTime) -> usize {
        let mut interrupted = 0;
        for operation in self.operations.iter_mut().filter(|op| !op.is_terminal()) {
            operation.status = OperationStatus::Failed;
            operation.completed_at = Some(now);
            operation.eta_seconds = None;
            operation.error_message = Some(INTERRUPTED_MESSAGE.into());
            interrupted += 1;
        }

        for resource in &mut self.resources {
            let recovered = match resource.status {
                ResourceStatus::Loading => ResourceStatus::Unloaded,
                ResourceStatus::Unloading => ResourceStatus::Loaded,
                other => other,
            };
            if recovered != resource.status {
                warn!(
                    resource = %resource.id,
                    from = ?resource.status,
                    to = ?recovered,
                    "reverting resource left mid-operation"
                );
                resource.status = recovered;
                if recovered == ResourceStatus::Unloaded {
                    resource.loaded_since = None;
                }
            }
        }

        if interrupted > 0 {
            info!("marked {interrupted} interrupted operation(s) as failed");
        }
        interrupted
    }
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .with_context(|| format!("open state file {}", self.path.display()))?;
        let state: PersistedState =
            serde_json::from_reader(file).context("parse state file")?;
        Ok(Some(state))
    }

    /// Writes to a sibling temp file and renames it over the old state.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create state directory")?;
        }
        let staging = self.path.with_extension("json.tmp");
        let file = File::create(&staging).context("create staging state file")?;
        serde_json::to_writer_pretty(file, state).context("write state file")?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replace state file {}", self.path.display()))?;
        Ok(())
    }
}
