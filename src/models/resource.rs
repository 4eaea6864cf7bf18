use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::LifecycleError;

static RESOURCE_ID_PATTERN: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^[a-z0-9][a-z0-9._:/-]*$").expect("resource id pattern compiles")
});

/// Registry-style identifier of a loadable model, e.g. `whisper-small` or `llama3:8b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    pub fn parse(value: impl Into<String>) -> Result<Self, LifecycleError> {
        let value = value.into();
        if RESOURCE_ID_PATTERN.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(LifecycleError::InvalidResourceId(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceId {
    type Error = LifecycleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl FromStr for ResourceId {
    type Err = LifecycleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    LanguageModel,
    SpeechRecognition,
    SpeechSynthesis,
    Translation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl ResourceStatus {
    /// `Loading` and `Unloading` only exist while an operation is running.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(self, ResourceStatus::Loading | ResourceStatus::Unloading)
    }
}

/// GPU and system memory taken by one loaded resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Footprint {
    pub gpu_bytes: u64,
    pub system_bytes: u64,
}

impl Footprint {
    #[must_use]
    pub fn new(gpu_bytes: u64, system_bytes: u64) -> Self {
        Self {
            gpu_bytes,
            system_bytes,
        }
    }
}

/// Multipliers applied to a declared size when no measured footprint exists yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FootprintPolicy {
    pub gpu_multiplier: f64,
    pub system_multiplier: f64,
}

impl Default for FootprintPolicy {
    fn default() -> Self {
        Self {
            gpu_multiplier: 0.8,
            system_multiplier: 0.3,
        }
    }
}

impl FootprintPolicy {
    #[must_use]
    pub fn estimate(&self, declared_size_bytes: u64) -> Footprint {
        Footprint {
            gpu_bytes: scale(declared_size_bytes, self.gpu_multiplier),
            system_bytes: scale(declared_size_bytes, self.system_multiplier),
        }
    }
}

fn scale(bytes: u64, multiplier: f64) -> u64 {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return 0;
    }
    (bytes as f64 * multiplier).round() as u64
}

/// A discovered, installable resource as reported by catalog sync or configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    pub declared_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    pub declared_size_bytes: u64,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_memory_bytes: Option<u64>,
    #[serde(default)]
    pub usage_percentage: f32,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_since: Option<OffsetDateTime>,
}

impl ResourceDescriptor {
    #[must_use]
    pub fn from_spec(spec: ResourceSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            kind: spec.kind,
            declared_size_bytes: spec.declared_size_bytes,
            status: ResourceStatus::Unloaded,
            gpu_memory_bytes: None,
            system_memory_bytes: None,
            usage_percentage: 0.0,
            request_count: 0,
            uptime_seconds: 0,
            location: spec.location,
            loaded_since: None,
        }
    }

    /// Footprint recorded by the last successful load, if any.
    #[must_use]
    pub fn measured_footprint(&self) -> Option<Footprint> {
        match (self.gpu_memory_bytes, self.system_memory_bytes) {
            (Some(gpu), Some(system)) => Some(Footprint::new(gpu, system)),
            _ => None,
        }
    }

    #[must_use]
    pub fn footprint(&self, policy: &FootprintPolicy) -> Footprint {
        self.measured_footprint()
            .unwrap_or_else(|| policy.estimate(self.declared_size_bytes))
    }

    pub(crate) fn refresh_uptime(&mut self, now: OffsetDateTime) {
        self.uptime_seconds = match (self.status, self.loaded_since) {
            (ResourceStatus::Loaded, Some(since)) => {
                (now - since).whole_seconds().max(0) as u64
            }
            _ => 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_validated() {
        assert!(ResourceId::parse("whisper-small").is_ok());
        assert!(ResourceId::parse("llama3:8b-instruct").is_ok());
        assert!(ResourceId::parse("org/model.v2").is_ok());
        assert!(matches!(
            ResourceId::parse("Whisper Small"),
            Err(LifecycleError::InvalidResourceId(_))
        ));
        assert!(ResourceId::parse("").is_err());
        assert!(ResourceId::parse("-leading-dash").is_err());
    }

    #[test]
    fn resource_id_rejects_invalid_json() {
        let parsed: Result<ResourceId, _> = serde_json::from_str("\"NOT VALID\"");
        assert!(parsed.is_err());
        let parsed: ResourceId = serde_json::from_str("\"tts-piper\"").unwrap();
        assert_eq!(parsed.as_str(), "tts-piper");
    }

    #[test]
    fn kind_is_a_closed_set() {
        let kind: ResourceKind = serde_json::from_str("\"speech-synthesis\"").unwrap();
        assert_eq!(kind, ResourceKind::SpeechSynthesis);
        assert!(serde_json::from_str::<ResourceKind>("\"image-generation\"").is_err());
    }

    #[test]
    fn default_policy_scales_declared_size() {
        let policy = FootprintPolicy::default();
        let footprint = policy.estimate(10_000);
        assert_eq!(footprint, Footprint::new(8_000, 3_000));
    }

    #[test]
    fn negative_multiplier_estimates_zero() {
        let policy = FootprintPolicy {
            gpu_multiplier: -1.0,
            system_multiplier: f64::NAN,
        };
        assert_eq!(policy.estimate(1_000), Footprint::default());
    }

    #[test]
    fn measured_footprint_wins_over_estimate() {
        let mut descriptor = ResourceDescriptor::from_spec(ResourceSpec {
            id: ResourceId::parse("asr-base").unwrap(),
            name: "ASR base".into(),
            kind: ResourceKind::SpeechRecognition,
            declared_size_bytes: 1_000,
            location: None,
        });
        let policy = FootprintPolicy::default();
        assert_eq!(descriptor.footprint(&policy), Footprint::new(800, 300));

        descriptor.gpu_memory_bytes = Some(650);
        descriptor.system_memory_bytes = Some(120);
        assert_eq!(descriptor.footprint(&policy), Footprint::new(650, 120));
    }
}
