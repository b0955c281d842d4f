//! State adapters: where artifacts live.
//!
//! The engine never talks to a backend directly. Every read and write goes
//! through the `AdapterGateway`, which routes by semantic artifact type to the
//! adapter bound in the configuration.

pub mod gateway;
pub mod jsonl;
pub mod memory;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Artifact, ArtifactLink, ArtifactRef};

pub use gateway::AdapterGateway;
pub use jsonl::JsonlAdapter;
pub use memory::MemoryAdapter;
pub use query::{ArtifactQuery, StoredArtifact};

/// Errors reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Transient: backend unreachable, timed out, rate limited
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the operation
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Optional operation not implemented by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// A persistence backend for artifacts.
///
/// `link` and `update_status` are optional; the defaults report
/// `Unsupported`, which the gateway turns into a non-fatal warning.
#[async_trait]
pub trait StateAdapter: Send + Sync {
    /// Backend tag used in qualified references
    fn backend(&self) -> &str;

    async fn read(&self, artifact_type: &str, id: &str) -> AdapterResult<StoredArtifact>;

    /// Create or replace; returns the qualified reference
    async fn write(&self, artifact: &Artifact) -> AdapterResult<ArtifactRef>;

    async fn list(&self, artifact_type: &str, query: &ArtifactQuery) -> AdapterResult<Vec<StoredArtifact>>;

    /// Record a link on `source`, which this backend holds
    async fn link(&self, _source: &ArtifactRef, _link: &ArtifactLink) -> AdapterResult<()> {
        Err(AdapterError::Unsupported("link".to_string()))
    }

    async fn update_status(&self, _reference: &ArtifactRef, _status: &str) -> AdapterResult<()> {
        Err(AdapterError::Unsupported("update_status".to_string()))
    }
}

/// Adapters available to the gateway, keyed by backend tag
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn StateAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn StateAdapter>) -> &mut Self {
        self.adapters.insert(adapter.backend().to_string(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn StateAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, backend: &str) -> Option<&Arc<dyn StateAdapter>> {
        self.adapters.get(backend)
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.adapters.contains_key(backend)
    }

    pub fn backends(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
