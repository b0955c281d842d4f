//! Artifacts and the unified cross-adapter reference format.
//!
//! An `ArtifactRef` is `{backend}:{artifact_type}:{id}`. The backend tag lets a
//! story stored in one backend link to a design document stored in another
//! without either adapter knowing the other's storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a textual reference cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed artifact reference '{0}', expected backend:type:id")]
pub struct RefParseError(pub String);

/// Backend-agnostic pointer to a work product
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Tag of the backend holding the artifact (may be empty when unresolved)
    pub backend: String,
    /// Semantic artifact type (story, design, test_spec, ...)
    pub artifact_type: String,
    /// Opaque id, meaningful only to the backend
    pub id: String,
}

impl ArtifactRef {
    pub fn new(backend: impl Into<String>, artifact_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            artifact_type: artifact_type.into(),
            id: id.into(),
        }
    }

    /// Reference without a backend tag; the gateway qualifies it from the type binding
    pub fn unqualified(artifact_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new("", artifact_type, id)
    }

    pub fn is_qualified(&self) -> bool {
        !self.backend.is_empty()
    }

    /// Type and id are present, the type cannot break the textual format and
    /// neither can escape a directory when a backend uses it as a file name
    pub fn is_well_formed(&self) -> bool {
        is_plain_segment(&self.artifact_type) && !self.artifact_type.contains(':') && is_plain_segment(&self.id)
    }

    /// Same artifact, regardless of backend tag
    pub fn same_artifact(&self, other: &ArtifactRef) -> bool {
        self.artifact_type == other.artifact_type && self.id == other.id
    }
}

/// Non-blank and free of path separators and parent-directory components
pub fn is_plain_segment(value: &str) -> bool {
    !value.trim().is_empty() && !value.contains(['/', '\\']) && !value.contains("..")
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.backend, self.artifact_type, self.id)
    }
}

impl FromStr for ArtifactRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(backend), Some(artifact_type), Some(id)) if !artifact_type.is_empty() && !id.is_empty() => {
                Ok(ArtifactRef::new(backend, artifact_type, id))
            }
            _ => Err(RefParseError(s.to_string())),
        }
    }
}

/// Directed relation from one artifact to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    pub target: ArtifactRef,
    pub relation: String,
}

impl ArtifactLink {
    pub fn new(target: ArtifactRef, relation: impl Into<String>) -> Self {
        Self {
            target,
            relation: relation.into(),
        }
    }
}

/// A produced work product, as returned by a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: String,
    pub id: String,
    /// Opaque content; the engine never interprets it
    #[serde(default)]
    pub content: String,
    /// Lifecycle status forwarded to the adapter (best effort)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ArtifactLink>,
}

impl Artifact {
    pub fn new(artifact_type: impl Into<String>, id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            id: id.into(),
            content: content.into(),
            status: None,
            links: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_link(mut self, target: ArtifactRef, relation: impl Into<String>) -> Self {
        self.links.push(ArtifactLink::new(target, relation));
        self
    }

    /// Reference to this artifact without a backend tag
    pub fn unqualified_ref(&self) -> ArtifactRef {
        ArtifactRef::unqualified(&self.artifact_type, &self.id)
    }

    pub fn same_identity(&self, other: &Artifact) -> bool {
        self.artifact_type == other.artifact_type && self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_display() {
        let r = ArtifactRef::new("tracker", "story", "PROJ-12");
        assert_eq!(r.to_string(), "tracker:story:PROJ-12");
    }

    #[test]
    fn test_ref_parse() {
        let r: ArtifactRef = "docs:design:auth/overview.md".parse().unwrap();
        assert_eq!(r.backend, "docs");
        assert_eq!(r.artifact_type, "design");
        assert_eq!(r.id, "auth/overview.md");
    }

    #[test]
    fn test_ref_parse_keeps_colons_in_id() {
        let r: ArtifactRef = "vcs:commit:repo:abc123".parse().unwrap();
        assert_eq!(r.artifact_type, "commit");
        assert_eq!(r.id, "repo:abc123");
    }

    #[test]
    fn test_ref_parse_rejects_malformed() {
        assert!("story".parse::<ArtifactRef>().is_err());
        assert!("docs:design".parse::<ArtifactRef>().is_err());
        assert!("docs::x".parse::<ArtifactRef>().is_err());
        assert!("docs:design:".parse::<ArtifactRef>().is_err());
    }

    #[test]
    fn test_ref_parse_allows_empty_backend() {
        let r: ArtifactRef = ":story:1".parse().unwrap();
        assert!(!r.is_qualified());
    }

    #[test]
    fn test_ref_well_formed() {
        assert!(ArtifactRef::new("m", "story", "1").is_well_formed());
        assert!(!ArtifactRef::new("m", "", "1").is_well_formed());
        assert!(!ArtifactRef::new("m", "story", " ").is_well_formed());
        assert!(!ArtifactRef::new("m", "a:b", "1").is_well_formed());
    }

    #[test]
    fn test_ref_rejects_path_components() {
        assert!(!ArtifactRef::new("m", "../etc", "1").is_well_formed());
        assert!(!ArtifactRef::new("m", "a/b", "1").is_well_formed());
        assert!(!ArtifactRef::new("m", "a\\b", "1").is_well_formed());
        assert!(!ArtifactRef::new("m", "story", "../../x").is_well_formed());
        assert!(ArtifactRef::new("m", "test_spec", "v1.2").is_well_formed());
    }

    #[test]
    fn test_same_artifact_ignores_backend() {
        let a = ArtifactRef::new("one", "story", "1");
        let b = ArtifactRef::unqualified("story", "1");
        assert!(a.same_artifact(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_artifact_builder() {
        let target = ArtifactRef::new("docs", "design", "d1");
        let a = Artifact::new("story", "s1", "As a user...")
            .with_status("in_progress")
            .with_link(target.clone(), "derived_from");
        assert_eq!(a.status.as_deref(), Some("in_progress"));
        assert_eq!(a.links.len(), 1);
        assert_eq!(a.links[0].target, target);
        assert_eq!(a.unqualified_ref(), ArtifactRef::unqualified("story", "s1"));
    }

    #[test]
    fn test_artifact_yaml_defaults() {
        let a: Artifact = serde_yaml::from_str("artifact_type: story\nid: s1\n").unwrap();
        assert!(a.content.is_empty());
        assert!(a.status.is_none());
        assert!(a.links.is_empty());
    }
}
