use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

mod cli;

use cli::Components;
use cli::commands::{Cli, Commands};
use loopflow::config::{ConfigFile, Configuration};
use loopflow::domain::{ArtifactRef, HumanDecision, InstanceStatus, LoopInstance, PhaseResult, PhaseStatus, TransitionKey};
use loopflow::id::InstanceId;
use loopflow::{Engine, EngineSnapshot, RunState, SnapshotStore};

const DEFAULT_STATE_FILE: &str = ".loopflow/state.json";

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loopflow")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("loopflow.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Everything a command needs
struct App {
    config: Configuration,
    components: Components,
    store: SnapshotStore,
}

impl App {
    fn load(cli: &Cli) -> Result<Self> {
        let (file, path) = ConfigFile::load(cli.config.as_ref())?;
        let config = file
            .build()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        let components = Components::load(&path)?;
        let state = cli.state.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
        info!("Configuration v{} from {}, state in {}", config.version(), path.display(), state.display());
        Ok(Self {
            config,
            components,
            store: SnapshotStore::new(state),
        })
    }

    fn engine(&self, snapshot: Option<EngineSnapshot>) -> Result<Engine> {
        let builder = Engine::builder(self.config.clone())
            .strategies(self.components.strategies())
            .adapters(self.components.adapters()?);
        let engine = match snapshot {
            Some(snapshot) => builder.restore(snapshot)?,
            None => builder.build()?,
        };
        Ok(engine)
    }

    fn saved_engine(&self) -> Result<Engine> {
        match self.store.load()? {
            Some(snapshot) => self.engine(Some(snapshot)),
            None => bail!("No saved run at {}; start one with 'loopflow run'", self.store.path().display()),
        }
    }

    // Drive the run until it needs a human, then save it
    async fn settle(&self, engine: &mut Engine) -> Result<RunState> {
        let state = engine.run_until_idle().await?;
        self.store.save(&engine.snapshot())?;
        Ok(state)
    }
}

async fn run_application(cli: &Cli) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Validate => handle_validate_command(cli),
        Commands::Policy { key } => handle_policy_command(cli, key),
        Commands::Run { seed, fresh } => handle_run_command(&App::load(cli)?, seed, *fresh).await,
        Commands::Status { id, detailed } => handle_status_command(&App::load(cli)?, id.as_deref(), *detailed),
        Commands::Approve { id, status, note } => {
            let status = status
                .as_deref()
                .map(|s| s.parse::<PhaseStatus>())
                .transpose()
                .map_err(|e| eyre::eyre!("{}", e))?;
            let decision = HumanDecision::Approve {
                status,
                artifacts: None,
                note: note.clone(),
            };
            handle_decision_command(&App::load(cli)?, id, decision).await
        }
        Commands::Reject { id, reason } => {
            handle_decision_command(&App::load(cli)?, id, HumanDecision::reject(reason.clone())).await
        }
        Commands::Collaborate { id, file } => {
            let result = read_result(file)?;
            handle_decision_command(&App::load(cli)?, id, HumanDecision::collaborate(result)).await
        }
        Commands::Retry { id, note } => {
            let decision = HumanDecision::Retry { note: note.clone() };
            handle_decision_command(&App::load(cli)?, id, decision).await
        }
        Commands::Abort { id } => handle_abort_command(&App::load(cli)?, id).await,
    }
}

fn handle_validate_command(cli: &Cli) -> Result<()> {
    let (file, path) = ConfigFile::load(cli.config.as_ref())?;
    let config = file
        .build()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    let components = Components::load(&path)?;

    println!("{} {} (v{})", "Valid:".green(), path.display(), config.version());
    for definition in config.levels() {
        let marker = if definition.level == config.root_level() { " (root)" } else { "" };
        let descend = definition
            .descend
            .as_deref()
            .map(|d| format!(" -> {}", d))
            .unwrap_or_default();
        println!(
            "  {}{}: {}{}",
            definition.level.cyan(),
            marker,
            definition.phases.join(", "),
            descend.dimmed()
        );
    }
    println!("  {} policies", config.policies().len());

    let registered = components.strategies();
    for id in config.strategy_ids() {
        if !registered.contains(id) {
            println!("  {} strategy '{}' has no component", "warning:".yellow(), id);
        }
    }
    Ok(())
}

fn handle_policy_command(cli: &Cli, key: &str) -> Result<()> {
    let config = Configuration::load(cli.config.as_ref())?;
    let key: TransitionKey = key.parse()?;
    let policy = config.policy_for(&key)?;
    println!("{} {}", "Key:".green(), key);
    println!("  matched:    {}", policy.key);
    println!("  mode:       {:?}", policy.mode);
    if let Some(max) = policy.max_iterations {
        println!("  max:        {} iterations", max);
    }
    if let Some(condition) = &policy.escalation_condition {
        println!("  escalation: {:?}", condition);
    }
    if let Some(timeout) = policy.timeout() {
        println!("  timeout:    {}s", timeout.as_secs());
    }
    println!("  join:       {:?}", policy.join_tolerance);
    Ok(())
}

async fn handle_run_command(app: &App, seeds: &[String], fresh: bool) -> Result<()> {
    if fresh {
        app.store.remove()?;
    }
    let mut engine = app.engine(app.store.load()?)?;
    if engine.tree().root().is_none() {
        if seeds.is_empty() {
            engine.seed(app.components.seed.clone()).await?;
        } else {
            let refs = seeds.iter().map(|s| parse_seed(s)).collect::<Result<Vec<_>>>()?;
            engine.start(refs)?;
        }
        println!("{} {}", "Started:".green(), engine.run_id());
    } else {
        engine.expire_overdue()?;
        println!("{} {}", "Continuing:".green(), engine.run_id());
    }
    let state = app.settle(&mut engine).await?;
    print_state(&state);
    Ok(())
}

fn handle_status_command(app: &App, id: Option<&str>, detailed: bool) -> Result<()> {
    let Some(snapshot) = app.store.load()? else {
        println!("{}", "No saved run".yellow());
        return Ok(());
    };
    println!("{} {} (saved {})", "Run:".green(), snapshot.run_id, snapshot.saved_at.to_rfc3339());
    match id {
        Some(id) => {
            let id = parse_id(id)?;
            let Some(instance) = snapshot.instance(id) else {
                bail!("No instance #{} in run {}", id, snapshot.run_id);
            };
            print_instance(instance, 0, true);
        }
        None => {
            if let Some(root) = snapshot.root {
                print_subtree(&snapshot, root, 0, detailed);
            }
        }
    }
    Ok(())
}

async fn handle_decision_command(app: &App, id: &str, decision: HumanDecision) -> Result<()> {
    let id = parse_id(id)?;
    let mut engine = app.saved_engine()?;
    engine.expire_overdue()?;
    let name = decision.name();
    engine.resume(id, decision).await?;
    println!("{} #{} ({})", "Resumed:".green(), id, name);
    let state = app.settle(&mut engine).await?;
    print_state(&state);
    Ok(())
}

async fn handle_abort_command(app: &App, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let mut engine = app.saved_engine()?;
    let aborted = engine.abort(id)?;
    println!("{} {} instance(s)", "Aborted:".red(), aborted.len());
    let state = app.settle(&mut engine).await?;
    print_state(&state);
    Ok(())
}

fn parse_id(id: &str) -> Result<InstanceId> {
    id.parse().with_context(|| format!("Invalid instance id '{}'", id))
}

// "type:id" is unqualified and routed by type; "backend:type:id" is used as is
fn parse_seed(seed: &str) -> Result<ArtifactRef> {
    let reference = if seed.matches(':').count() == 1 {
        format!(":{}", seed).parse::<ArtifactRef>()
    } else {
        seed.parse::<ArtifactRef>()
    };
    reference.map_err(|e| eyre::eyre!("Invalid seed reference '{}': {}", seed, e))
}

fn read_result(path: &Path) -> Result<PhaseResult> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse result in {}", path.display()))
}

fn print_state(state: &RunState) {
    match state {
        RunState::Finished { root, status } => println!("{} root #{} {}", "Finished:".green(), root, colored_status(*status)),
        RunState::AwaitingHuman(ids) => {
            let ids: Vec<String> = ids.iter().map(|id| format!("#{}", id)).collect();
            println!("{} {}", "Awaiting human:".yellow(), ids.join(", "));
        }
        RunState::Idle => println!("{}", "Idle".dimmed()),
    }
}

fn print_subtree(snapshot: &EngineSnapshot, id: InstanceId, depth: usize, detailed: bool) {
    let Some(instance) = snapshot.instance(id) else {
        return;
    };
    print_instance(instance, depth, detailed);
    for child in &instance.children {
        print_subtree(snapshot, *child, depth + 1, detailed);
    }
}

fn print_instance(instance: &LoopInstance, depth: usize, detailed: bool) {
    let indent = "  ".repeat(depth);
    println!(
        "{}#{} {}.{} (iteration {}) {}{}",
        indent,
        instance.id,
        instance.level,
        instance.phase,
        instance.iteration,
        colored_status(instance.status),
        if instance.retired { " [retired]".dimmed().to_string() } else { String::new() }
    );
    if let Some(suspension) = &instance.suspension {
        println!("{}  {} {}", indent, "waiting:".yellow(), suspension.reason);
    }
    if let Some(failure) = &instance.failure {
        println!("{}  {} {}", indent, "failure:".red(), failure);
    }
    if detailed {
        for artifact in &instance.artifacts {
            println!("{}  artifact {}", indent, artifact);
        }
        for entry in &instance.history {
            println!(
                "{}  {}#{} {}{}",
                indent,
                entry.phase,
                entry.iteration,
                entry.status,
                entry.note.as_deref().map(|n| format!(": {}", n)).unwrap_or_default()
            );
        }
    }
}

fn colored_status(status: InstanceStatus) -> ColoredString {
    match status {
        InstanceStatus::Running => status.as_str().cyan(),
        InstanceStatus::PausedForHuman => status.as_str().yellow(),
        InstanceStatus::Blocked => status.as_str().red(),
        InstanceStatus::Completed => status.as_str().green(),
        InstanceStatus::Failed => status.as_str().red().bold(),
        InstanceStatus::Aborted => status.as_str().dimmed(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli).await.context("Application failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed() {
        assert_eq!(parse_seed("story:s1").unwrap(), ArtifactRef::unqualified("story", "s1"));
        assert_eq!(parse_seed("tracker:story:s1").unwrap(), ArtifactRef::new("tracker", "story", "s1"));
        assert!(parse_seed("story").is_err());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("#3").unwrap(), InstanceId(3));
        assert!(parse_id("three").is_err());
    }

    #[test]
    fn test_read_result() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("result.yml");
        fs::write(&path, "status: done\nnext_action: ship it\n").unwrap();
        let result = read_result(&path).unwrap();
        assert_eq!(result.status, PhaseStatus::Done);
        assert_eq!(result.next_action.as_deref(), Some("ship it"));
    }
}
