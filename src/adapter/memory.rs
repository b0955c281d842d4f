//! In-memory adapter.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::{AdapterError, AdapterResult, ArtifactQuery, StateAdapter, StoredArtifact};
use crate::domain::{Artifact, ArtifactLink, ArtifactRef};

type Key = (String, String);

/// Adapter keeping everything in a map; optional capabilities can be turned off.
pub struct MemoryAdapter {
    backend: String,
    records: RwLock<BTreeMap<Key, StoredArtifact>>,
    supports_links: bool,
    supports_status: bool,
    /// Remaining calls that report `Unavailable`
    outages: AtomicU32,
}

impl MemoryAdapter {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            records: RwLock::new(BTreeMap::new()),
            supports_links: true,
            supports_status: true,
            outages: AtomicU32::new(0),
        }
    }

    pub fn without_links(mut self) -> Self {
        self.supports_links = false;
        self
    }

    pub fn without_status(mut self) -> Self {
        self.supports_status = false;
        self
    }

    /// Make the next `count` operations fail as unavailable
    pub fn simulate_outage(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> AdapterResult<()> {
        let remaining = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(AdapterError::Unavailable(format!("{} is down", self.backend))),
            Err(_) => Ok(()),
        }
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> AdapterError {
        AdapterError::Unavailable(e.to_string())
    }

    fn key(artifact_type: &str, id: &str) -> Key {
        (artifact_type.to_string(), id.to_string())
    }
}

#[async_trait]
impl StateAdapter for MemoryAdapter {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn read(&self, artifact_type: &str, id: &str) -> AdapterResult<StoredArtifact> {
        self.check_available()?;
        let records = self.records.read().map_err(Self::poisoned)?;
        records
            .get(&Self::key(artifact_type, id))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{}:{}:{}", self.backend, artifact_type, id)))
    }

    async fn write(&self, artifact: &Artifact) -> AdapterResult<ArtifactRef> {
        self.check_available()?;
        let mut records = self.records.write().map_err(Self::poisoned)?;
        let key = Self::key(&artifact.artifact_type, &artifact.id);
        match records.get_mut(&key) {
            Some(existing) => existing.overwrite(artifact),
            None => {
                records.insert(key, StoredArtifact::from_artifact(&self.backend, artifact));
            }
        }
        Ok(ArtifactRef::new(&self.backend, &artifact.artifact_type, &artifact.id))
    }

    async fn list(&self, artifact_type: &str, query: &ArtifactQuery) -> AdapterResult<Vec<StoredArtifact>> {
        self.check_available()?;
        let records = self.records.read().map_err(Self::poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.reference.artifact_type == artifact_type && query.matches(r))
            .cloned()
            .collect())
    }

    async fn link(&self, source: &ArtifactRef, link: &ArtifactLink) -> AdapterResult<()> {
        if !self.supports_links {
            return Err(AdapterError::Unsupported("link".to_string()));
        }
        self.check_available()?;
        let mut records = self.records.write().map_err(Self::poisoned)?;
        let record = records
            .get_mut(&Self::key(&source.artifact_type, &source.id))
            .ok_or_else(|| AdapterError::NotFound(source.to_string()))?;
        record.add_link(link);
        Ok(())
    }

    async fn update_status(&self, reference: &ArtifactRef, status: &str) -> AdapterResult<()> {
        if !self.supports_status {
            return Err(AdapterError::Unsupported("update_status".to_string()));
        }
        self.check_available()?;
        let mut records = self.records.write().map_err(Self::poisoned)?;
        let record = records
            .get_mut(&Self::key(&reference.artifact_type, &reference.id))
            .ok_or_else(|| AdapterError::NotFound(reference.to_string()))?;
        record.set_status(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let adapter = MemoryAdapter::new("mem");
        let r = adapter.write(&Artifact::new("story", "1", "body")).await.unwrap();
        assert_eq!(r.to_string(), "mem:story:1");
        let stored = adapter.read("story", "1").await.unwrap();
        assert_eq!(stored.content, "body");
        assert_eq!(adapter.len(), 1);
    }

    #[tokio::test]
    async fn test_read_missing() {
        let adapter = MemoryAdapter::new("mem");
        assert!(matches!(adapter.read("story", "x").await, Err(AdapterError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_is_upsert() {
        let adapter = MemoryAdapter::new("mem");
        adapter.write(&Artifact::new("story", "1", "v1")).await.unwrap();
        let r = ArtifactRef::new("mem", "story", "1");
        adapter.update_status(&r, "ready").await.unwrap();
        adapter.write(&Artifact::new("story", "1", "v2")).await.unwrap();
        let stored = adapter.read("story", "1").await.unwrap();
        assert_eq!(stored.content, "v2");
        assert_eq!(stored.status.as_deref(), Some("ready"));
        assert_eq!(adapter.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_type_and_query() {
        let adapter = MemoryAdapter::new("mem");
        adapter.write(&Artifact::new("story", "1", "")).await.unwrap();
        adapter.write(&Artifact::new("story", "2", "")).await.unwrap();
        adapter.write(&Artifact::new("design", "1", "")).await.unwrap();
        adapter
            .update_status(&ArtifactRef::new("mem", "story", "2"), "done")
            .await
            .unwrap();

        assert_eq!(adapter.list("story", &ArtifactQuery::all()).await.unwrap().len(), 2);
        let done = adapter
            .list("story", &ArtifactQuery::all().with_status("done"))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].reference.id, "2");
    }

    #[tokio::test]
    async fn test_disabled_capabilities() {
        let adapter = MemoryAdapter::new("mem").without_links().without_status();
        adapter.write(&Artifact::new("story", "1", "")).await.unwrap();
        let r = ArtifactRef::new("mem", "story", "1");
        let link = ArtifactLink::new(ArtifactRef::new("docs", "design", "d"), "implements");
        assert!(matches!(adapter.link(&r, &link).await, Err(AdapterError::Unsupported(_))));
        assert!(matches!(adapter.update_status(&r, "x").await, Err(AdapterError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let adapter = MemoryAdapter::new("mem");
        adapter.simulate_outage(2);
        let artifact = Artifact::new("story", "1", "");
        assert!(matches!(adapter.write(&artifact).await, Err(AdapterError::Unavailable(_))));
        assert!(matches!(adapter.write(&artifact).await, Err(AdapterError::Unavailable(_))));
        assert!(adapter.write(&artifact).await.is_ok());
    }
}
