//! JSONL file adapter with in-memory caching.
//!
//! One `{artifact_type}.jsonl` file per type under the base directory. New
//! records are appended; updates rewrite the file from the cache.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{AdapterError, AdapterResult, ArtifactQuery, StateAdapter, StoredArtifact};
use crate::domain::{is_plain_segment, Artifact, ArtifactLink, ArtifactRef};

pub struct JsonlAdapter {
    backend: String,
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Vec<StoredArtifact>>>,
}

impl JsonlAdapter {
    /// Create an adapter storing files under `base_path`.
    pub fn new(backend: impl Into<String>, base_path: impl AsRef<Path>) -> AdapterResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(io_error)?;
        Ok(Self {
            backend: backend.into(),
            base_path,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn type_path(&self, artifact_type: &str) -> AdapterResult<PathBuf> {
        if !is_plain_segment(artifact_type) {
            return Err(AdapterError::Rejected(format!("artifact type '{}' is not a file name", artifact_type)));
        }
        Ok(self.base_path.join(format!("{}.jsonl", artifact_type)))
    }

    /// Load a type's file into cache if not already loaded.
    fn ensure_loaded(&self, artifact_type: &str) -> AdapterResult<()> {
        {
            let cache = self.cache.read().map_err(lock_error)?;
            if cache.contains_key(artifact_type) {
                return Ok(());
            }
        }

        let mut cache = self.cache.write().map_err(lock_error)?;
        if cache.contains_key(artifact_type) {
            return Ok(());
        }

        let path = self.type_path(artifact_type)?;
        let records = if path.exists() {
            let file = File::open(&path).map_err(io_error)?;
            let reader = BufReader::new(file);
            let mut records = Vec::new();
            for line in reader.lines() {
                let line = line.map_err(io_error)?;
                if !line.trim().is_empty() {
                    let record: StoredArtifact = serde_json::from_str(&line)
                        .map_err(|e| AdapterError::Rejected(format!("corrupt record in {}: {}", path.display(), e)))?;
                    records.push(record);
                }
            }
            records
        } else {
            Vec::new()
        };

        cache.insert(artifact_type.to_string(), records);
        Ok(())
    }

    fn append_to_file(&self, record: &StoredArtifact) -> AdapterResult<()> {
        let path = self.type_path(&record.reference.artifact_type)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_error)?;
        let line = serde_json::to_string(record).map_err(|e| AdapterError::Rejected(e.to_string()))?;
        writeln!(file, "{}", line).map_err(io_error)?;
        Ok(())
    }

    fn rewrite_file(&self, artifact_type: &str, records: &[StoredArtifact]) -> AdapterResult<()> {
        let path = self.type_path(artifact_type)?;
        let mut file = File::create(&path).map_err(io_error)?;
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| AdapterError::Rejected(e.to_string()))?;
            writeln!(file, "{}", line).map_err(io_error)?;
        }
        Ok(())
    }

    /// Apply `change` to one cached record and rewrite its file
    fn modify(&self, reference: &ArtifactRef, change: impl FnOnce(&mut StoredArtifact)) -> AdapterResult<()> {
        self.ensure_loaded(&reference.artifact_type)?;
        let mut cache = self.cache.write().map_err(lock_error)?;
        let records = cache
            .get_mut(&reference.artifact_type)
            .ok_or_else(|| AdapterError::NotFound(reference.to_string()))?;
        let record = records
            .iter_mut()
            .find(|r| r.reference.id == reference.id)
            .ok_or_else(|| AdapterError::NotFound(reference.to_string()))?;
        change(record);
        self.rewrite_file(&reference.artifact_type, records)
    }
}

fn io_error(e: std::io::Error) -> AdapterError {
    AdapterError::Unavailable(e.to_string())
}

fn lock_error<E: std::fmt::Display>(e: E) -> AdapterError {
    AdapterError::Unavailable(e.to_string())
}

#[async_trait]
impl StateAdapter for JsonlAdapter {
    fn backend(&self) -> &str {
        &self.backend
    }

    async fn read(&self, artifact_type: &str, id: &str) -> AdapterResult<StoredArtifact> {
        self.ensure_loaded(artifact_type)?;
        let cache = self.cache.read().map_err(lock_error)?;
        cache
            .get(artifact_type)
            .and_then(|records| records.iter().find(|r| r.reference.id == id))
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("{}:{}:{}", self.backend, artifact_type, id)))
    }

    async fn write(&self, artifact: &Artifact) -> AdapterResult<ArtifactRef> {
        let reference = ArtifactRef::new(&self.backend, &artifact.artifact_type, &artifact.id);
        self.ensure_loaded(&artifact.artifact_type)?;

        let exists = {
            let cache = self.cache.read().map_err(lock_error)?;
            cache
                .get(&artifact.artifact_type)
                .map(|records| records.iter().any(|r| r.reference.id == artifact.id))
                .unwrap_or(false)
        };

        if exists {
            self.modify(&reference, |record| record.overwrite(artifact))?;
        } else {
            let record = StoredArtifact::from_artifact(&self.backend, artifact);
            // Append to file first (source of truth)
            self.append_to_file(&record)?;
            let mut cache = self.cache.write().map_err(lock_error)?;
            cache.entry(artifact.artifact_type.clone()).or_default().push(record);
        }
        Ok(reference)
    }

    async fn list(&self, artifact_type: &str, query: &ArtifactQuery) -> AdapterResult<Vec<StoredArtifact>> {
        self.ensure_loaded(artifact_type)?;
        let cache = self.cache.read().map_err(lock_error)?;
        Ok(cache
            .get(artifact_type)
            .map(|records| records.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn link(&self, source: &ArtifactRef, link: &ArtifactLink) -> AdapterResult<()> {
        self.modify(source, |record| record.add_link(link))
    }

    async fn update_status(&self, reference: &ArtifactRef, status: &str) -> AdapterResult<()> {
        self.modify(reference, |record| record.set_status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_adapter() -> (JsonlAdapter, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let adapter = JsonlAdapter::new("files", temp_dir.path()).unwrap();
        (adapter, temp_dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (adapter, _temp) = create_test_adapter();
        let r = adapter.write(&Artifact::new("design", "d1", "# Design")).await.unwrap();
        assert_eq!(r, ArtifactRef::new("files", "design", "d1"));
        let stored = adapter.read("design", "d1").await.unwrap();
        assert_eq!(stored.content, "# Design");
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let adapter = JsonlAdapter::new("files", temp_dir.path()).unwrap();
            adapter.write(&Artifact::new("design", "d1", "v1")).await.unwrap();
            adapter.write(&Artifact::new("design", "d1", "v2")).await.unwrap();
            adapter
                .update_status(&ArtifactRef::new("files", "design", "d1"), "approved")
                .await
                .unwrap();
        }
        let reopened = JsonlAdapter::new("files", temp_dir.path()).unwrap();
        let stored = reopened.read("design", "d1").await.unwrap();
        assert_eq!(stored.content, "v2");
        assert_eq!(stored.status.as_deref(), Some("approved"));
        assert_eq!(reopened.list("design", &ArtifactQuery::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_file_per_type() {
        let (adapter, temp) = create_test_adapter();
        adapter.write(&Artifact::new("design", "d1", "")).await.unwrap();
        adapter.write(&Artifact::new("story", "s1", "")).await.unwrap();
        assert!(temp.path().join("design.jsonl").exists());
        assert!(temp.path().join("story.jsonl").exists());
    }

    #[tokio::test]
    async fn test_link_and_list_by_relation() {
        let (adapter, _temp) = create_test_adapter();
        adapter.write(&Artifact::new("story", "s1", "")).await.unwrap();
        adapter.write(&Artifact::new("story", "s2", "")).await.unwrap();
        let source = ArtifactRef::new("files", "story", "s1");
        let link = ArtifactLink::new(ArtifactRef::new("tracker", "epic", "E1"), "child_of");
        adapter.link(&source, &link).await.unwrap();

        let children = adapter
            .list("story", &ArtifactQuery::all().with_relation("child_of"))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].reference.id, "s1");
    }

    #[tokio::test]
    async fn test_link_missing_source() {
        let (adapter, _temp) = create_test_adapter();
        let source = ArtifactRef::new("files", "story", "nope");
        let link = ArtifactLink::new(ArtifactRef::new("x", "y", "z"), "rel");
        assert!(matches!(adapter.link(&source, &link).await, Err(AdapterError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_type_cannot_leave_base_path() {
        let (adapter, temp) = create_test_adapter();
        let result = adapter.write(&Artifact::new("../escaped", "x", "")).await;
        assert!(matches!(result, Err(AdapterError::Rejected(_))));
        assert!(adapter.list("a/b", &ArtifactQuery::all()).await.is_err());
        assert!(!temp.path().parent().unwrap().join("escaped.jsonl").exists());
    }

    #[tokio::test]
    async fn test_list_unknown_type_is_empty() {
        let (adapter, _temp) = create_test_adapter();
        assert!(adapter.list("nothing", &ArtifactQuery::all()).await.unwrap().is_empty());
    }
}
