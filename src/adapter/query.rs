//! Stored artifact records and list queries.

use serde::{Deserialize, Serialize};

use crate::domain::{Artifact, ArtifactLink, ArtifactRef};

/// An artifact as a backend holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    /// Fully qualified reference
    pub reference: ArtifactRef,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ArtifactLink>,
    pub updated_at: u64,
}

impl StoredArtifact {
    /// Record for a freshly written artifact; links and status are applied separately
    pub fn from_artifact(backend: &str, artifact: &Artifact) -> Self {
        Self {
            reference: ArtifactRef::new(backend, &artifact.artifact_type, &artifact.id),
            content: artifact.content.clone(),
            status: None,
            links: Vec::new(),
            updated_at: crate::id::now_ms(),
        }
    }

    /// Upsert: replace content, keep links and lifecycle status
    pub fn overwrite(&mut self, artifact: &Artifact) {
        self.content = artifact.content.clone();
        self.updated_at = crate::id::now_ms();
    }

    /// Add a link unless the same one is already recorded
    pub fn add_link(&mut self, link: &ArtifactLink) {
        if !self.links.contains(link) {
            self.links.push(link.clone());
            self.updated_at = crate::id::now_ms();
        }
    }

    pub fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
        self.updated_at = crate::id::now_ms();
    }

    /// Back to the shape a strategy produces
    pub fn to_artifact(&self) -> Artifact {
        Artifact {
            artifact_type: self.reference.artifact_type.clone(),
            id: self.reference.id.clone(),
            content: self.content.clone(),
            status: self.status.clone(),
            links: self.links.clone(),
        }
    }
}

/// Filter for `list`. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactQuery {
    /// Has at least one link with this relation
    pub relation: Option<String>,
    /// Has a link pointing at this artifact (backend ignored when empty)
    pub linked_to: Option<ArtifactRef>,
    /// Lifecycle status equals
    pub status: Option<String>,
    /// Id starts with
    pub id_prefix: Option<String>,
}

impl ArtifactQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn linked_to(mut self, target: ArtifactRef) -> Self {
        self.linked_to = Some(target);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, record: &StoredArtifact) -> bool {
        if let Some(status) = &self.status {
            if record.status.as_deref() != Some(status.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.id_prefix {
            if !record.reference.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.relation.is_none() && self.linked_to.is_none() {
            return true;
        }
        // relation and target must hold for the same link
        record.links.iter().any(|link| {
            let relation_ok = self.relation.as_ref().is_none_or(|r| &link.relation == r);
            let target_ok = self.linked_to.as_ref().is_none_or(|t| {
                link.target.same_artifact(t) && (t.backend.is_empty() || t.backend == link.target.backend)
            });
            relation_ok && target_ok
        })
    }
}
