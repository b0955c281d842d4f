//! Strategy that runs a shell command per phase.
//!
//! The command receives the phase context through `LOOPFLOW_*` environment
//! variables. Exit code 0 means `done`, anything else `needs_more`; stdout is
//! kept as an output artifact. A command may instead print a full
//! `PhaseResult` as YAML or JSON, which is then used as is.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{PhaseStrategy, StrategyContext, StrategyError};
use crate::domain::{Artifact, PhaseResult};

/// Configuration for a command strategy
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// The command to execute
    pub command: String,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Timeout in milliseconds (default: 300000)
    pub timeout_ms: u64,
    /// Working directory (default: current)
    pub workdir: Option<PathBuf>,
    /// Type of the artifact holding the command's output
    pub output_type: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            env: Vec::new(),
            timeout_ms: 300_000,
            workdir: None,
            output_type: "command_output".to_string(),
        }
    }
}

impl CommandConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn output_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.output_type = artifact_type.into();
        self
    }
}

pub struct CommandStrategy {
    config: CommandConfig,
}

impl CommandStrategy {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn simple(command: impl Into<String>) -> Self {
        Self::new(CommandConfig::new(command))
    }

    pub fn command(&self) -> &str {
        &self.config.command
    }

    async fn run(&self, ctx: &StrategyContext) -> Result<std::process::Output, StrategyError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.config.command);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }

        let inputs: Vec<String> = ctx.inputs.iter().map(|a| a.reference.to_string()).collect();
        cmd.env("LOOPFLOW_INSTANCE", ctx.instance.to_string())
            .env("LOOPFLOW_LEVEL", &ctx.level)
            .env("LOOPFLOW_PHASE", &ctx.phase)
            .env("LOOPFLOW_ITERATION", ctx.iteration.to_string())
            .env("LOOPFLOW_INPUTS", inputs.join(","));
        if let Some(feedback) = ctx.last_feedback() {
            cmd.env("LOOPFLOW_FEEDBACK", feedback);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| StrategyError::Execution(format!("failed to spawn '{}': {}", self.config.command, e)))?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| StrategyError::Execution(e.to_string())),
            Err(_) => Err(StrategyError::Timeout(timeout)),
        }
    }

    fn output_artifact(&self, ctx: &StrategyContext, content: String) -> Artifact {
        let id = format!("{}-{}-{}-{}", ctx.instance, ctx.level, ctx.phase, ctx.iteration);
        Artifact::new(&self.config.output_type, id, content)
    }
}

/// A printed result must at least carry a status field
fn parse_printed_result(stdout: &str) -> Option<PhaseResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || !trimmed.contains("status") {
        return None;
    }
    serde_yaml::from_str(trimmed).ok()
}

#[async_trait]
impl PhaseStrategy for CommandStrategy {
    async fn execute(&self, ctx: &StrategyContext) -> Result<PhaseResult, StrategyError> {
        log::debug!("Running '{}' for {}.{} (#{})", self.config.command, ctx.level, ctx.phase, ctx.instance);
        let output = self.run(ctx).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if output.status.success() {
            if let Some(result) = parse_printed_result(&stdout) {
                return Ok(result);
            }
            return Ok(PhaseResult::done().with_artifact(self.output_artifact(ctx, stdout)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut detail = format!("'{}' exited with {:?}", self.config.command, output.status.code());
        if !stderr.trim().is_empty() {
            detail.push_str(&format!(": {}", stderr.trim()));
        }
        let content = if stdout.is_empty() { stderr.to_string() } else { stdout };
        Ok(PhaseResult::needs_more()
            .with_artifact(self.output_artifact(ctx, content))
            .with_detail(detail))
    }
}
