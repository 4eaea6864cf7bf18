use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::resource::{
    Footprint, ResourceDescriptor, ResourceId, ResourceKind, ResourceSpec, ResourceStatus,
};
use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceFilter {
    pub kind: Option<ResourceKind>,
    pub status: Option<ResourceStatus>,
}

impl ResourceFilter {
    #[must_use]
    pub fn matches(&self, descriptor: &ResourceDescriptor) -> bool {
        self.kind.map_or(true, |kind| descriptor.kind == kind)
            && self.status.map_or(true, |status| descriptor.status == status)
    }
}

/// Inventory of every resource discovered this session. Entries are never
/// removed; only the lifecycle manager changes their status and footprint.
#[derive(Default)]
pub struct ResourceCatalog {
    entries: RwLock<Vec<ResourceDescriptor>>,
}

impl ResourceCatalog {
    pub fn new(specs: impl IntoIterator<Item = ResourceSpec>) -> Self {
        let catalog = Self::default();
        catalog.sync(specs);
        catalog
    }

    pub(crate) fn from_descriptors(descriptors: Vec<ResourceDescriptor>) -> Self {
        Self {
            entries: RwLock::new(descriptors),
        }
    }

    /// Merges discovered resources in. Known ids keep their status, footprint
    /// and usage metrics. Returns how many entries were new.
    pub fn sync(&self, specs: impl IntoIterator<Item = ResourceSpec>) -> usize {
        let mut entries = self.entries.write();
        let mut added = 0;
        for spec in specs {
            if let Some(existing) = entries.iter_mut().find(|entry| entry.id == spec.id) {
                existing.name = spec.name;
                existing.kind = spec.kind;
                existing.declared_size_bytes = spec.declared_size_bytes;
                existing.location = spec.location;
            } else {
                debug!(resource = %spec.id, "catalog entry discovered");
                entries.push(ResourceDescriptor::from_spec(spec));
                added += 1;
            }
        }
        if added > 0 {
            info!("catalog sync added {added} resource(s), {} total", entries.len());
        }
        added
    }

    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<ResourceDescriptor> {
        let now = OffsetDateTime::now_utc();
        self.entries
            .read()
            .iter()
            .find(|entry| &entry.id == id)
            .cloned()
            .map(|mut descriptor| {
                descriptor.refresh_uptime(now);
                descriptor
            })
    }

    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.read().iter().any(|entry| &entry.id == id)
    }

    #[must_use]
    pub fn status(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.entries
            .read()
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| entry.status)
    }

    #[must_use]
    pub fn list(&self, filter: &ResourceFilter) -> Vec<ResourceDescriptor> {
        let now = OffsetDateTime::now_utc();
        self.entries
            .read()
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .map(|mut descriptor| {
                descriptor.refresh_uptime(now);
                descriptor
            })
            .collect()
    }

    #[must_use]
    pub fn loaded_ids(&self) -> Vec<ResourceId> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.status == ResourceStatus::Loaded)
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Sum of measured GPU bytes over `Loaded` resources.
    #[must_use]
    pub fn loaded_gpu_bytes(&self) -> u64 {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.status == ResourceStatus::Loaded)
            .map(|entry| entry.gpu_memory_bytes.unwrap_or(0))
            .sum()
    }

    pub fn record_usage(
        &self,
        id: &ResourceId,
        requests: u64,
        usage_percentage: f32,
    ) -> LifecycleResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| LifecycleError::ResourceNotFound(id.clone()))?;
        if entry.status != ResourceStatus::Loaded {
            return Err(LifecycleError::InvalidTransition {
                resource_id: id.clone(),
                status: entry.status,
                action: "record usage for",
            });
        }
        entry.request_count = entry.request_count.saturating_add(requests);
        entry.usage_percentage = if usage_percentage.is_finite() {
            usage_percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Ok(())
    }

    pub(crate) fn descriptors(&self) -> Vec<ResourceDescriptor> {
        self.entries.read().clone()
    }

    /// Sets a new status and returns the previous one.
    pub(crate) fn set_status(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
    ) -> Option<ResourceStatus> {
        self.update(id, |entry| {
            let previous = entry.status;
            entry.status = status;
            if matches!(status, ResourceStatus::Unloaded | ResourceStatus::Error) {
                entry.loaded_since = None;
                entry.usage_percentage = 0.0;
            }
            previous
        })
    }

    pub(crate) fn mark_loaded(&self, id: &ResourceId, measured: Footprint, now: OffsetDateTime) {
        self.update(id, |entry| {
            entry.status = ResourceStatus::Loaded;
            entry.gpu_memory_bytes = Some(measured.gpu_bytes);
            entry.system_memory_bytes = Some(measured.system_bytes);
            entry.loaded_since = Some(now);
        });
    }

    fn update<T>(&self, id: &ResourceId, f: impl FnOnce(&mut ResourceDescriptor) -> T) -> Option<T> {
        let mut entries = self.entries.write();
        entries.iter_mut().find(|entry| &entry.id == id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, kind: ResourceKind, size: u64) -> ResourceSpec {
        ResourceSpec {
            id: ResourceId::parse(id).unwrap(),
            name: id.to_uppercase(),
            kind,
            declared_size_bytes: size,
            location: None,
        }
    }

    #[test]
    fn sync_adds_new_and_keeps_known_state() {
        let catalog = ResourceCatalog::new([spec("llm", ResourceKind::LanguageModel, 100)]);
        let id = ResourceId::parse("llm").unwrap();
        catalog.mark_loaded(&id, Footprint::new(80, 30), OffsetDateTime::now_utc());

        let added = catalog.sync([
            spec("llm", ResourceKind::LanguageModel, 120),
            spec("asr", ResourceKind::SpeechRecognition, 50),
        ]);

        assert_eq!(added, 1);
        let llm = catalog.get(&id).unwrap();
        assert_eq!(llm.status, ResourceStatus::Loaded);
        assert_eq!(llm.declared_size_bytes, 120);
        assert_eq!(llm.gpu_memory_bytes, Some(80));
        assert_eq!(catalog.list(&ResourceFilter::default()).len(), 2);
    }

    #[test]
    fn filter_by_kind_and_status() {
        let catalog = ResourceCatalog::new([
            spec("llm", ResourceKind::LanguageModel, 100),
            spec("asr", ResourceKind::SpeechRecognition, 50),
            spec("tts", ResourceKind::SpeechSynthesis, 20),
        ]);
        let asr = ResourceId::parse("asr").unwrap();
        catalog.mark_loaded(&asr, Footprint::new(40, 10), OffsetDateTime::now_utc());

        let loaded = catalog.list(&ResourceFilter {
            status: Some(ResourceStatus::Loaded),
            ..ResourceFilter::default()
        });
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, asr);

        let speech = catalog.list(&ResourceFilter {
            kind: Some(ResourceKind::SpeechSynthesis),
            ..ResourceFilter::default()
        });
        assert_eq!(speech.len(), 1);
        assert_eq!(catalog.loaded_gpu_bytes(), 40);
        assert_eq!(catalog.loaded_ids(), vec![asr]);
    }

    #[test]
    fn usage_requires_loaded_resource() {
        let catalog = ResourceCatalog::new([spec("llm", ResourceKind::LanguageModel, 100)]);
        let id = ResourceId::parse("llm").unwrap();
        assert!(matches!(
            catalog.record_usage(&id, 1, 10.0),
            Err(LifecycleError::InvalidTransition { .. })
        ));

        catalog.mark_loaded(&id, Footprint::new(80, 30), OffsetDateTime::now_utc());
        catalog.record_usage(&id, 3, 42.5).unwrap();
        catalog.record_usage(&id, 2, 250.0).unwrap();
        let entry = catalog.get(&id).unwrap();
        assert_eq!(entry.request_count, 5);
        assert_eq!(entry.usage_percentage, 100.0);

        let missing = ResourceId::parse("missing").unwrap();
        assert!(matches!(
            catalog.record_usage(&missing, 1, 1.0),
            Err(LifecycleError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn leaving_loaded_clears_uptime() {
        let catalog = ResourceCatalog::new([spec("llm", ResourceKind::LanguageModel, 100)]);
        let id = ResourceId::parse("llm").unwrap();
        let an_hour_ago = OffsetDateTime::now_utc() - time::Duration::hours(1);
        catalog.mark_loaded(&id, Footprint::new(80, 30), an_hour_ago);
        assert!(catalog.get(&id).unwrap().uptime_seconds >= 3600);

        let previous = catalog.set_status(&id, ResourceStatus::Unloading);
        assert_eq!(previous, Some(ResourceStatus::Loaded));
        let entry = catalog.get(&id).unwrap();
        assert_eq!(entry.uptime_seconds, 0);
        assert!(entry.loaded_since.is_some());

        catalog.set_status(&id, ResourceStatus::Unloaded);
        assert!(catalog.get(&id).unwrap().loaded_since.is_none());
    }
}
