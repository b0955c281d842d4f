//! Strategy and adapter wiring for the command line.
//!
//! The engine only knows strategy and adapter ids. The `components` section
//! of the configuration file says what each id is:
//!
//! ```yaml
//! components:
//!   strategies:
//!     design: { kind: command, command: "./scripts/design.sh", timeout-ms: 60000 }
//!     review: { kind: script, results: [{ status: done }] }
//!   adapters:
//!     files: { kind: jsonl, path: .loopflow/artifacts }
//!   seed:
//!     - { artifact_type: story, id: s1, content: "Add login" }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use serde::Deserialize;

use loopflow::adapter::{AdapterRegistry, JsonlAdapter, MemoryAdapter};
use loopflow::domain::{Artifact, PhaseResult};
use loopflow::strategy::{CommandConfig, CommandStrategy, ScriptedStrategy, StrategyRegistry};

/// Component declarations from the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Components {
    pub strategies: BTreeMap<String, StrategySpec>,
    pub adapters: BTreeMap<String, AdapterSpec>,
    /// Artifacts persisted and handed to the root when a run starts
    pub seed: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StrategySpec {
    /// Plays back fixed results; an empty list means `done`
    Script {
        #[serde(default)]
        results: Vec<PhaseResult>,
    },
    Command {
        command: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, rename = "timeout-ms")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        workdir: Option<PathBuf>,
        #[serde(default, rename = "output-type")]
        output_type: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AdapterSpec {
    Memory,
    Jsonl { path: PathBuf },
}

#[derive(Deserialize)]
struct ComponentsSection {
    #[serde(default)]
    components: Components,
}

impl Components {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let section: ComponentsSection = serde_yaml::from_str(content).context("Failed to parse components")?;
        Ok(section.components)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_yaml_str(&content).with_context(|| format!("Invalid components in {}", path.display()))
    }

    pub fn strategies(&self) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        for (id, spec) in &self.strategies {
            match spec {
                StrategySpec::Script { results } => {
                    let script = if results.is_empty() {
                        vec![PhaseResult::done()]
                    } else {
                        results.clone()
                    };
                    registry.register(id.clone(), Arc::new(ScriptedStrategy::new(script)));
                }
                StrategySpec::Command {
                    command,
                    env,
                    timeout_ms,
                    workdir,
                    output_type,
                } => {
                    let mut config = CommandConfig::new(command.clone());
                    for (key, value) in env {
                        config = config.env(key.clone(), value.clone());
                    }
                    if let Some(ms) = timeout_ms {
                        config = config.timeout_ms(*ms);
                    }
                    if let Some(dir) = workdir {
                        config = config.workdir(dir.clone());
                    }
                    if let Some(artifact_type) = output_type {
                        config = config.output_type(artifact_type.clone());
                    }
                    registry.register(id.clone(), Arc::new(CommandStrategy::new(config)));
                }
            }
        }
        registry
    }

    /// Adapters are registered under their id, which doubles as the
    /// backend tag of every reference they hand out.
    pub fn adapters(&self) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        for (id, spec) in &self.adapters {
            match spec {
                AdapterSpec::Memory => {
                    registry.register(Arc::new(MemoryAdapter::new(id.clone())));
                }
                AdapterSpec::Jsonl { path } => {
                    let adapter = JsonlAdapter::new(id.clone(), path)
                        .with_context(|| format!("Failed to open adapter '{}' at {}", id, path.display()))?;
                    registry.register(Arc::new(adapter));
                }
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
version: 1
root: execution
components:
  strategies:
    design: { kind: command, command: "echo hi", timeout-ms: 1000, env: { MODE: fast } }
    review: { kind: script, results: [{ status: needs_more }, { status: done }] }
    noop: { kind: script }
  adapters:
    mem: { kind: memory }
  seed:
    - { artifact_type: story, id: s1, content: "Add login" }
"#;

    #[test]
    fn test_parse_components() {
        let components = Components::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(components.strategies.len(), 3);
        assert!(matches!(
            components.strategies.get("design"),
            Some(StrategySpec::Command { timeout_ms: Some(1000), .. })
        ));
        assert_eq!(components.seed.len(), 1);
        assert_eq!(components.seed[0].id, "s1");

        let strategies = components.strategies();
        assert_eq!(strategies.ids(), vec!["design", "noop", "review"]);
        let adapters = components.adapters().unwrap();
        assert_eq!(adapters.backends(), vec!["mem"]);
    }

    #[test]
    fn test_example_config() {
        let content = include_str!("../../loopflow.example.yml");
        let config = loopflow::config::Configuration::from_yaml_str(content).unwrap();
        assert_eq!(config.root_level(), "release");
        let components = Components::from_yaml_str(content).unwrap();
        for id in config.strategy_ids() {
            assert!(components.strategies().contains(id), "no component for '{}'", id);
        }
        assert_eq!(components.seed[0].artifact_type, "brief");
    }

    #[test]
    fn test_missing_section_is_empty() {
        let components = Components::from_yaml_str("version: 1\nroot: execution\n").unwrap();
        assert!(components.strategies.is_empty());
        assert!(components.adapters.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = "components:\n  adapters:\n    x: { kind: postgres }\n";
        assert!(Components::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_jsonl_adapter() {
        let temp = TempDir::new().unwrap();
        let yaml = format!(
            "components:\n  adapters:\n    files: {{ kind: jsonl, path: {} }}\n",
            temp.path().join("artifacts").display()
        );
        let components = Components::from_yaml_str(&yaml).unwrap();
        let adapters = components.adapters().unwrap();
        assert!(adapters.contains("files"));
    }
}
