use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{info, warn};

use crate::models::{FootprintPolicy, ResourceId, ResourceKind, ResourceSpec};

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";
const ENV_CONFIG: &str = "LIFECYCLE_CONFIG";
const GIB: u64 = 1024 * 1024 * 1024;

/// Maximum run time of an operation: a fixed base plus a per-GiB allowance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutPolicy {
    pub base_secs: u64,
    pub secs_per_gib: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            secs_per_gib: 20,
        }
    }
}

impl TimeoutPolicy {
    #[must_use]
    pub fn limit_for(&self, declared_size_bytes: u64) -> Duration {
        let gib = declared_size_bytes.div_ceil(GIB);
        Duration::from_secs(
            self.base_secs
                .saturating_add(gib.saturating_mul(self.secs_per_gib)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerSettings {
    pub total_gpu_bytes: u64,
    /// Physical memory is detected when unset.
    pub total_system_bytes: Option<u64>,
    pub footprint: FootprintPolicy,
    pub retention_per_resource: usize,
    pub timeout: TimeoutPolicy,
    pub sweep_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub presets: BTreeMap<String, Vec<ResourceId>>,
    pub resources: Vec<ResourceSpec>,
    pub state_path: Option<PathBuf>,
    pub simulated_bytes_per_sec: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            total_gpu_bytes: 8 * GIB,
            total_system_bytes: None,
            footprint: FootprintPolicy::default(),
            retention_per_resource: 5,
            timeout: TimeoutPolicy::default(),
            sweep_interval_ms: 1_000,
            poll_interval_ms: 500,
            presets: default_presets(),
            resources: default_resources(),
            state_path: None,
            simulated_bytes_per_sec: 2 * GIB,
        }
    }
}

impl ManagerSettings {
    /// Reads `$LIFECYCLE_CONFIG`, or `config.json` in the platform config
    /// directory. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(ENV_CONFIG) {
            Some(path) => PathBuf::from(path),
            None => resolve_config_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no settings at {path:?}; using defaults");
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
        let parsed: ManagerSettings =
            serde_json::from_slice(&bytes).context("settings json could not be parsed")?;
        info!("loaded settings from {path:?}");
        Ok(parsed)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
        }
        let serialized =
            serde_json::to_vec_pretty(self).context("serialize settings to json failed")?;
        fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
        Ok(())
    }

    #[must_use]
    pub fn system_budget_bytes(&self) -> u64 {
        if let Some(total) = self.total_system_bytes {
            return total;
        }
        let mut system = System::new();
        system.refresh_memory();
        let detected = system.total_memory();
        if detected == 0 {
            warn!("could not detect physical memory; system budget is zero");
        }
        detected
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Where durable state lives: the configured path, else the platform data directory.
    pub fn resolved_state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_path {
            return Ok(path.clone());
        }
        let dirs = project_dirs()?;
        Ok(dirs.data_dir().join(STATE_FILE))
    }
}

pub fn resolve_config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.config_dir().join(CONFIG_FILE))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "ModelLifecycle", "ModelLifecycle")
        .context("missing project directories")
}

fn default_resources() -> Vec<ResourceSpec> {
    [
        ("llama-3.1-8b-q4", "Llama 3.1 8B (Q4_K_M)", ResourceKind::LanguageModel, 4_920 * 1024 * 1024),
        ("qwen2.5-3b-q4", "Qwen 2.5 3B (Q4_K_M)", ResourceKind::LanguageModel, 1_930 * 1024 * 1024),
        ("whisper-small", "Whisper small", ResourceKind::SpeechRecognition, 488 * 1024 * 1024),
        ("piper-en-us", "Piper en_US voice", ResourceKind::SpeechSynthesis, 63 * 1024 * 1024),
        ("nllb-600m", "NLLB-200 distilled 600M", ResourceKind::Translation, 2_460 * 1024 * 1024),
    ]
    .into_iter()
    .filter_map(|(id, name, kind, size)| {
        Some(ResourceSpec {
            id: ResourceId::parse(id).ok()?,
            name: name.into(),
            kind,
            declared_size_bytes: size,
            location: None,
        })
    })
    .collect()
}

fn default_presets() -> BTreeMap<String, Vec<ResourceId>> {
    [
        ("assistant", vec!["llama-3.1-8b-q4", "whisper-small", "piper-en-us"]),
        ("dictation", vec!["whisper-small", "qwen2.5-3b-q4"]),
        ("translate", vec!["whisper-small", "nllb-600m", "piper-en-us"]),
    ]
    .into_iter()
    .map(|(name, ids)| {
        let ids = ids
            .into_iter()
            .filter_map(|id| ResourceId::parse(id).ok())
            .collect();
        (name.to_string(), ids)
    })
    .collect()
}
