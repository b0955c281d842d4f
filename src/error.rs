//! Error types for loopflow
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A strategy returned `failed`, errored, or panicked
    #[error("Strategy failure: {0}")]
    StrategyFailure(String),

    /// A backend was unreachable or rejected an operation after retries
    #[error("Adapter failure: {0}")]
    AdapterFailure(String),

    /// The bound adapter does not implement an optional operation
    #[error("Capability unsupported: {operation} on backend '{backend}'")]
    CapabilityUnsupported { backend: String, operation: String },

    /// Missing binding, unknown level, malformed definition
    #[error("Config error: {0}")]
    Config(String),

    /// A phase re-entered more often than its policy allows
    #[error("Iteration cap exceeded: {0}")]
    IterationCapExceeded(String),

    /// Instance not present in the tree
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Shorthand for an invalid state error
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    /// Returns true for errors that should be surfaced as a non-fatal warning
    pub fn is_capability_unsupported(&self) -> bool {
        matches!(self, EngineError::CapabilityUnsupported { .. })
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let err = EngineError::config("no policy matches execution.design -> execution.implement");
        assert_eq!(
            err.to_string(),
            "Config error: no policy matches execution.design -> execution.implement"
        );
    }

    #[test]
    fn test_capability_unsupported_display() {
        let err = EngineError::CapabilityUnsupported {
            backend: "tracker".to_string(),
            operation: "link".to_string(),
        };
        assert_eq!(err.to_string(), "Capability unsupported: link on backend 'tracker'");
        assert!(err.is_capability_unsupported());
    }

    #[test]
    fn test_invalid_state_error() {
        let err = EngineError::invalid("instance 3 is not suspended");
        assert_eq!(err.to_string(), "Invalid state: instance 3 is not suspended");
        assert!(!err.is_capability_unsupported());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: EngineError = json_err.into();
        assert!(matches!(err, EngineError::Json(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<String>>("{ not: [a list").unwrap_err();
        let err: EngineError = yaml_err.into();
        assert!(matches!(err, EngineError::Yaml(_)));
    }
}
