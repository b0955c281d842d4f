//! Configuration for loopflow.
//!
//! A configuration file declares every loop level, the policy table, the
//! strategy table and the per-type adapter table. Once built, a
//! `Configuration` is immutable and shared as `Arc<Configuration>`; changing
//! it at runtime requires an explicit versioned reload.
//!
//! Loaded from `./loopflow.yml` or `~/.config/loopflow/loopflow.yml`.

mod policy_table;
mod settings;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use eyre::Context;
use serde::{Deserialize, Serialize};

pub use self::policy_table::PolicyTable;
pub use self::settings::{EngineSettings, RetryConfig};

use crate::domain::{LoopDefinition, TransitionKey, TransitionPolicy, WILDCARD};
use crate::error::{EngineError, Result};

/// Project configuration file name.
pub const CONFIG_FILE_NAME: &str = "loopflow.yml";

/// Raw, unvalidated configuration as it appears on disk.
///
/// Unknown top-level sections are ignored so that front ends can keep their
/// own settings in the same file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Monotonic configuration version; reloads must increase it.
    pub version: u64,

    /// Level of the root instance.
    pub root: String,

    /// Loop level definitions.
    pub levels: Vec<LoopDefinition>,

    /// Explicit policies; override level defaults with the same key.
    pub policies: Vec<TransitionPolicy>,

    /// `level.phase` -> strategy id; overrides level defaults.
    pub strategies: BTreeMap<String, String>,

    /// Artifact type -> adapter id (`*` is the fallback binding).
    pub adapters: BTreeMap<String, String>,

    pub settings: EngineSettings,
}

impl ConfigFile {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            version: 1,
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_level(mut self, definition: LoopDefinition) -> Self {
        self.levels.push(definition);
        self
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_strategy(mut self, level: &str, phase: &str, strategy: &str) -> Self {
        self.strategies.insert(strategy_key(level, phase), strategy.to_string());
        self
    }

    pub fn with_adapter(mut self, artifact_type: &str, adapter: &str) -> Self {
        self.adapters.insert(artifact_type.to_string(), adapter.to_string());
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load the configuration file with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. loopflow.yml in current directory
    /// 3. ~/.config/loopflow/loopflow.yml
    pub fn load(explicit_path: Option<&PathBuf>) -> eyre::Result<(Self, PathBuf)> {
        if let Some(path) = explicit_path {
            let config = Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?;
            return Ok((config, path.clone()));
        }

        let project_config = PathBuf::from(CONFIG_FILE_NAME);
        if project_config.exists() {
            log::info!("Loading config from {}", project_config.display());
            let config = Self::load_from_file(&project_config)?;
            return Ok((config, project_config));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("loopflow").join(CONFIG_FILE_NAME);
            if user_config.exists() {
                log::info!("Loading config from {}", user_config.display());
                let config = Self::load_from_file(&user_config)?;
                return Ok((config, user_config));
            }
        }

        eyre::bail!(
            "No configuration found: pass --config or create {} (or ~/.config/loopflow/{})",
            CONFIG_FILE_NAME,
            CONFIG_FILE_NAME
        )
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let config: Self =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<Configuration> {
        Configuration::build(self)
    }
}

/// Key of the strategy table
pub fn strategy_key(level: &str, phase: &str) -> String {
    format!("{}.{}", level, phase)
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    version: u64,
    root: String,
    definitions: BTreeMap<String, LoopDefinition>,
    policies: PolicyTable,
    strategies: BTreeMap<String, String>,
    adapters: BTreeMap<String, String>,
    settings: EngineSettings,
}

impl Configuration {
    pub fn build(file: ConfigFile) -> Result<Self> {
        file.settings.validate()?;

        let mut definitions = BTreeMap::new();
        for definition in file.levels {
            definition.validate()?;
            let level = definition.level.clone();
            if definitions.insert(level.clone(), definition).is_some() {
                return Err(EngineError::config(format!("level '{}' defined twice", level)));
            }
        }

        if file.root.is_empty() {
            return Err(EngineError::config("no root level configured"));
        }
        if !definitions.contains_key(&file.root) {
            return Err(EngineError::config(format!("root level '{}' is not defined", file.root)));
        }

        for policy in &file.policies {
            policy.validate()?;
        }
        let policies = PolicyTable::from_parts(definitions.values().flat_map(|d| d.policies.iter()), &file.policies)?;

        for (key, id) in &file.strategies {
            let (level, phase) = key
                .split_once('.')
                .ok_or_else(|| EngineError::config(format!("strategy key '{}' must be level.phase", key)))?;
            let known = definitions
                .get(level)
                .map(|d| d.phase_index(phase).is_some())
                .unwrap_or(false);
            if !known {
                return Err(EngineError::config(format!("strategy key '{}' names an unknown phase", key)));
            }
            if id.trim().is_empty() {
                return Err(EngineError::config(format!("strategy key '{}' has an empty id", key)));
            }
        }

        for (artifact_type, adapter) in &file.adapters {
            if artifact_type.is_empty() || adapter.trim().is_empty() {
                return Err(EngineError::config(format!(
                    "adapter binding '{}' -> '{}' is incomplete",
                    artifact_type, adapter
                )));
            }
        }

        let config = Self {
            version: file.version,
            root: file.root,
            definitions,
            policies,
            strategies: file.strategies,
            adapters: file.adapters,
            settings: file.settings,
        };
        config.check_descend_graph()?;
        config.check_coverage()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        ConfigFile::from_yaml_str(content)?.build()
    }

    /// Load and build, see `ConfigFile::load` for the search chain
    pub fn load(explicit_path: Option<&PathBuf>) -> eyre::Result<Self> {
        let (file, path) = ConfigFile::load(explicit_path)?;
        let config = file
            .build()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        log::info!(
            "Configuration v{} loaded from {} ({} levels)",
            config.version,
            path.display(),
            config.definitions.len()
        );
        Ok(config)
    }

    // Descend targets must exist and never loop back
    fn check_descend_graph(&self) -> Result<()> {
        for definition in self.definitions.values() {
            if let Some(target) = &definition.descend {
                if !self.definitions.contains_key(target) {
                    return Err(EngineError::config(format!(
                        "level '{}' descends into unknown level '{}'",
                        definition.level, target
                    )));
                }
            }
        }
        for start in self.definitions.keys() {
            let mut visited = HashSet::new();
            let mut current = Some(start.as_str());
            while let Some(level) = current {
                if !visited.insert(level) {
                    return Err(EngineError::config(format!("descend chain starting at '{}' is cyclic", start)));
                }
                current = self.definitions.get(level).and_then(|d| d.descend.as_deref());
            }
        }
        Ok(())
    }

    // Every phase needs a strategy and every transition a policy
    fn check_coverage(&self) -> Result<()> {
        for definition in self.definitions.values() {
            for phase in &definition.phases {
                self.strategy_id(&definition.level, phase)?;
            }
            for key in definition.transition_keys() {
                self.policies.lookup(&key)?;
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root_level(&self) -> &str {
        &self.root
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn levels(&self) -> impl Iterator<Item = &LoopDefinition> {
        self.definitions.values()
    }

    pub fn definition(&self, level: &str) -> Result<&LoopDefinition> {
        self.definitions
            .get(level)
            .ok_or_else(|| EngineError::config(format!("unknown level '{}'", level)))
    }

    /// Definition children of `level` are created at
    pub fn descend_target(&self, level: &str) -> Result<&LoopDefinition> {
        let definition = self.definition(level)?;
        let target = definition
            .descend
            .as_deref()
            .ok_or_else(|| EngineError::config(format!("level '{}' has no descend target", level)))?;
        self.definition(target)
    }

    pub fn policy_for(&self, key: &TransitionKey) -> Result<&TransitionPolicy> {
        self.policies.lookup(key)
    }

    /// Policy governing the transition out of `phase_index` of `level`
    pub fn policy_at(&self, level: &str, phase_index: usize) -> Result<&TransitionPolicy> {
        let key = self.definition(level)?.transition_key(phase_index)?;
        self.policies.lookup(&key)
    }

    pub fn strategy_id(&self, level: &str, phase: &str) -> Result<&str> {
        if let Some(id) = self.strategies.get(&strategy_key(level, phase)) {
            return Ok(id);
        }
        self.definition(level)?
            .strategies
            .get(phase)
            .map(String::as_str)
            .ok_or_else(|| EngineError::config(format!("no strategy bound to {}.{}", level, phase)))
    }

    /// Adapter bound to an artifact type, falling back to `*`
    pub fn adapter_id(&self, artifact_type: &str) -> Option<&str> {
        self.adapters
            .get(artifact_type)
            .or_else(|| self.adapters.get(WILDCARD))
            .map(String::as_str)
    }

    /// Every adapter id referenced by the type table
    pub fn adapter_ids(&self) -> HashSet<&str> {
        self.adapters.values().map(String::as_str).collect()
    }

    /// Every strategy id referenced by any phase
    pub fn strategy_ids(&self) -> HashSet<&str> {
        let mut ids: HashSet<&str> = self.strategies.values().map(String::as_str).collect();
        for definition in self.definitions.values() {
            ids.extend(definition.strategies.values().map(String::as_str));
        }
        ids
    }
}
