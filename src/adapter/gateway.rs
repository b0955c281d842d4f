//! Adapter gateway: routes artifact operations to the bound backend.
//!
//! Routing is by semantic artifact type through the configuration's adapter
//! table, or by the backend tag of an already qualified reference. Writes,
//! links and status updates to one artifact are serialized; operations on
//! different artifacts never wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{AdapterError, AdapterRegistry, AdapterResult, ArtifactQuery, StateAdapter, StoredArtifact};
use crate::config::{Configuration, RetryConfig};
use crate::domain::{Artifact, ArtifactLink, ArtifactRef};
use crate::error::{EngineError, Result};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on one artifact. The table entry is removed when the last
/// holder lets go and nobody is queued behind it.
struct ArtifactLock {
    guard: Option<OwnedMutexGuard<()>>,
    entry: Arc<AsyncMutex<()>>,
    key: String,
    locks: LockTable,
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = locks
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.entry) && Arc::strong_count(current) == 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct AdapterGateway {
    config: Arc<Configuration>,
    registry: AdapterRegistry,
    locks: LockTable,
    retry: RetryConfig,
}

impl AdapterGateway {
    /// Every adapter id named in the configuration must be registered.
    pub fn new(config: Arc<Configuration>, registry: AdapterRegistry) -> Result<Self> {
        for id in config.adapter_ids() {
            if !registry.contains(id) {
                return Err(EngineError::config(format!("adapter '{}' is bound but not registered", id)));
            }
        }
        let retry = config.settings().retry.clone();
        Ok(Self {
            config,
            registry,
            locks: Arc::new(Mutex::new(HashMap::new())),
            retry,
        })
    }

    /// Same adapters and lock table, new bindings
    pub fn with_config(&self, config: Arc<Configuration>) -> Result<Self> {
        let mut gateway = Self::new(config, self.registry.clone())?;
        gateway.locks = Arc::clone(&self.locks);
        Ok(gateway)
    }

    fn adapter_for_type(&self, artifact_type: &str) -> Result<&Arc<dyn StateAdapter>> {
        let id = self
            .config
            .adapter_id(artifact_type)
            .ok_or_else(|| EngineError::config(format!("no adapter bound to artifact type '{}'", artifact_type)))?;
        self.registry
            .get(id)
            .ok_or_else(|| EngineError::config(format!("adapter '{}' is not registered", id)))
    }

    fn adapter_for_ref(&self, reference: &ArtifactRef) -> Result<&Arc<dyn StateAdapter>> {
        if reference.is_qualified() {
            return self
                .registry
                .get(&reference.backend)
                .ok_or_else(|| EngineError::config(format!("unknown backend in reference {}", reference)));
        }
        self.adapter_for_type(&reference.artifact_type)
    }

    /// Fill in the backend tag from the type binding
    pub fn qualify(&self, reference: &ArtifactRef) -> Result<ArtifactRef> {
        if reference.is_qualified() {
            return Ok(reference.clone());
        }
        let adapter = self.adapter_for_type(&reference.artifact_type)?;
        Ok(ArtifactRef::new(adapter.backend(), &reference.artifact_type, &reference.id))
    }

    async fn lock(&self, key: String) -> ArtifactLock {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        let mut held = ArtifactLock {
            guard: None,
            entry,
            key,
            locks: Arc::clone(&self.locks),
        };
        held.guard = Some(Arc::clone(&held.entry).lock_owned().await);
        held
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, backend: &str, operation: &str, target: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        backend,
                        operation,
                        target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Adapter unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AdapterError::Unsupported(_)) => {
                    return Err(EngineError::CapabilityUnsupported {
                        backend: backend.to_string(),
                        operation: operation.to_string(),
                    });
                }
                Err(e) => {
                    return Err(EngineError::AdapterFailure(format!(
                        "{} {} on '{}' failed after {} attempt(s): {}",
                        operation, target, backend, attempt, e
                    )));
                }
            }
        }
    }

    pub async fn read(&self, reference: &ArtifactRef) -> Result<StoredArtifact> {
        let adapter = self.adapter_for_ref(reference)?;
        let target = reference.to_string();
        self.with_retry(adapter.backend(), "read", &target, || {
            adapter.read(&reference.artifact_type, &reference.id)
        })
        .await
    }

    pub async fn write(&self, artifact: &Artifact) -> Result<ArtifactRef> {
        let adapter = self.adapter_for_type(&artifact.artifact_type)?;
        let target = ArtifactRef::new(adapter.backend(), &artifact.artifact_type, &artifact.id).to_string();
        let _guard = self.lock(target.clone()).await;
        self.with_retry(adapter.backend(), "write", &target, || adapter.write(artifact))
            .await
    }

    pub async fn list(&self, artifact_type: &str, query: &ArtifactQuery) -> Result<Vec<StoredArtifact>> {
        let adapter = self.adapter_for_type(artifact_type)?;
        self.with_retry(adapter.backend(), "list", artifact_type, || adapter.list(artifact_type, query))
            .await
    }

    /// Record `link` on `source`; the link is kept by the source's backend
    pub async fn link(&self, source: &ArtifactRef, link: &ArtifactLink) -> Result<()> {
        let source = self.qualify(source)?;
        let link = ArtifactLink::new(self.qualify(&link.target)?, &link.relation);
        let adapter = self.adapter_for_ref(&source)?;
        let target = source.to_string();
        let _guard = self.lock(target.clone()).await;
        self.with_retry(adapter.backend(), "link", &target, || adapter.link(&source, &link))
            .await
    }

    pub async fn update_status(&self, reference: &ArtifactRef, status: &str) -> Result<()> {
        let reference = self.qualify(reference)?;
        let adapter = self.adapter_for_ref(&reference)?;
        let target = reference.to_string();
        let _guard = self.lock(target.clone()).await;
        self.with_retry(adapter.backend(), "update_status", &target, || {
            adapter.update_status(&reference, status)
        })
        .await
    }

    /// Read every referenced artifact, in order
    pub async fn resolve(&self, refs: &[ArtifactRef]) -> Result<Vec<StoredArtifact>> {
        let mut resolved = Vec::with_capacity(refs.len());
        for reference in refs {
            resolved.push(self.read(reference).await?);
        }
        Ok(resolved)
    }

    /// Write produced artifacts, then apply their links and lifecycle status.
    ///
    /// Links and statuses are best effort: a backend without the capability
    /// is logged and skipped.
    pub async fn persist(&self, artifacts: &[Artifact]) -> Result<Vec<ArtifactRef>> {
        let mut refs = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            refs.push(self.write(artifact).await?);
        }

        for (artifact, reference) in artifacts.iter().zip(&refs) {
            for link in &artifact.links {
                match self.link(reference, link).await {
                    Err(e) if e.is_capability_unsupported() => {
                        log::warn!("Skipping link {} -[{}]-> {}: {}", reference, link.relation, link.target, e);
                    }
                    other => other?,
                }
            }
            if let Some(status) = &artifact.status {
                match self.update_status(reference, status).await {
                    Err(e) if e.is_capability_unsupported() => {
                        log::warn!("Skipping status '{}' for {}: {}", status, reference, e);
                    }
                    other => other?,
                }
            }
        }

        log::debug!("Persisted {} artifact(s)", refs.len());
        Ok(refs)
    }
}

impl std::fmt::Debug for AdapterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterGateway")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::config::{ConfigFile, EngineSettings};
    use crate::domain::{LoopDefinition, TransitionPolicy};

    fn config(bindings: &[(&str, &str)]) -> Arc<Configuration> {
        let mut file = ConfigFile::new("execution")
            .with_level(LoopDefinition::new("execution", &["a"]).with_strategy_for_all("s"))
            .with_policy(TransitionPolicy::autonomous("*.* -> *.*".parse().unwrap()))
            .with_settings(EngineSettings {
                retry: RetryConfig {
                    max_attempts: 3,
                    initial_backoff_ms: 1,
                    max_backoff_ms: 2,
                },
                ..Default::default()
            });
        for (artifact_type, adapter) in bindings {
            file = file.with_adapter(artifact_type, adapter);
        }
        Arc::new(file.build().unwrap())
    }

    fn gateway() -> (AdapterGateway, Arc<MemoryAdapter>, Arc<MemoryAdapter>) {
        let tracker = Arc::new(MemoryAdapter::new("tracker"));
        let docs = Arc::new(MemoryAdapter::new("docs").without_links());
        let registry = AdapterRegistry::new()
            .with(tracker.clone() as Arc<dyn StateAdapter>)
            .with(docs.clone() as Arc<dyn StateAdapter>);
        let gateway = AdapterGateway::new(config(&[("story", "tracker"), ("*", "docs")]), registry).unwrap();
        (gateway, tracker, docs)
    }

    #[test]
    fn test_unregistered_adapter_is_config_error() {
        let err = AdapterGateway::new(config(&[("story", "jira")]), AdapterRegistry::new()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_routes_by_type() {
        let (gateway, tracker, docs) = gateway();
        let story = gateway.write(&Artifact::new("story", "S-1", "")).await.unwrap();
        let design = gateway.write(&Artifact::new("design", "D-1", "")).await.unwrap();
        assert_eq!(story.backend, "tracker");
        assert_eq!(design.backend, "docs");
        assert_eq!(tracker.len(), 1);
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_unbound_type_without_fallback() {
        let registry = AdapterRegistry::new().with(Arc::new(MemoryAdapter::new("tracker")));
        let gateway = AdapterGateway::new(config(&[("story", "tracker")]), registry).unwrap();
        let err = gateway.write(&Artifact::new("design", "D-1", "")).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_read_unqualified_ref() {
        let (gateway, _, _) = gateway();
        gateway.write(&Artifact::new("story", "S-1", "text")).await.unwrap();
        let stored = gateway.read(&ArtifactRef::unqualified("story", "S-1")).await.unwrap();
        assert_eq!(stored.content, "text");
        assert_eq!(stored.reference.backend, "tracker");
    }

    #[tokio::test]
    async fn test_cross_adapter_link_recorded_on_source() {
        let (gateway, _, _) = gateway();
        gateway.write(&Artifact::new("design", "D-1", "")).await.unwrap();
        let story = Artifact::new("story", "S-1", "").with_link(ArtifactRef::unqualified("design", "D-1"), "implements");
        gateway.persist(&[story]).await.unwrap();

        let linked = gateway
            .list(
                "story",
                &ArtifactQuery::all()
                    .with_relation("implements")
                    .linked_to(ArtifactRef::new("docs", "design", "D-1")),
            )
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].reference.id, "S-1");
    }

    #[tokio::test]
    async fn test_persist_skips_unsupported_links() {
        let (gateway, _, docs) = gateway();
        let design = Artifact::new("design", "D-1", "").with_link(ArtifactRef::new("tracker", "story", "S-1"), "for");
        let refs = gateway.persist(&[design]).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_direct_link_reports_unsupported() {
        let (gateway, _, _) = gateway();
        gateway.write(&Artifact::new("design", "D-1", "")).await.unwrap();
        let err = gateway
            .link(
                &ArtifactRef::unqualified("design", "D-1"),
                &ArtifactLink::new(ArtifactRef::new("tracker", "story", "S-1"), "for"),
            )
            .await
            .unwrap_err();
        assert!(err.is_capability_unsupported());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (gateway, tracker, _) = gateway();
        tracker.simulate_outage(2);
        let r = gateway.write(&Artifact::new("story", "S-1", "")).await.unwrap();
        assert_eq!(r.backend, "tracker");
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_adapter_failure() {
        let (gateway, tracker, _) = gateway();
        tracker.simulate_outage(10);
        let err = gateway.write(&Artifact::new("story", "S-1", "")).await.unwrap_err();
        assert!(matches!(err, EngineError::AdapterFailure(_)));
    }

    #[tokio::test]
    async fn test_persist_applies_status() {
        let (gateway, _, _) = gateway();
        let story = Artifact::new("story", "S-1", "").with_status("ready");
        gateway.persist(&[story]).await.unwrap();
        let stored = gateway.read(&ArtifactRef::new("tracker", "story", "S-1")).await.unwrap();
        assert_eq!(stored.status.as_deref(), Some("ready"));
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_artifact() {
        let (gateway, tracker, _) = gateway();
        let mut handles = Vec::new();
        for i in 0..8 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway
                    .write(&Artifact::new("story", "S-1", format!("v{}", i)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_table_is_emptied_after_use() {
        let (gateway, tracker, _) = gateway();
        for i in 0..200 {
            gateway
                .persist(&[Artifact::new("story", format!("S-{}", i), "").with_status("ready")])
                .await
                .unwrap();
        }
        assert_eq!(tracker.len(), 200);
        assert_eq!(gateway.lock_count(), 0);

        let mut handles = Vec::new();
        for i in 0..8 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway.write(&Artifact::new("story", "S-0", format!("v{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(gateway.lock_count(), 0);
    }
}
