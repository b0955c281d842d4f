//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - validate / policy: inspect the configuration
//! - run: start or continue the saved run
//! - status: show the loop tree
//! - approve / reject / collaborate / retry / abort: human decisions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Loopflow - nested phase-loop workflow engine
#[derive(Parser, Debug)]
#[command(name = "loopflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Run state file (default: .loopflow/state.json)
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the configuration and list its levels
    Validate,

    /// Show the policy governing a transition
    Policy {
        /// Transition key, e.g. "execution.design -> execution.implement"
        key: String,
    },

    /// Start a run, or continue the saved one, until it needs a human
    Run {
        /// Seed artifact reference ([backend:]type:id); repeatable
        #[arg(short, long)]
        seed: Vec<String>,

        /// Discard any saved run first
        #[arg(long)]
        fresh: bool,
    },

    /// Show the instances of the saved run
    Status {
        /// Only this instance
        id: Option<String>,

        /// Include history
        #[arg(short, long)]
        detailed: bool,
    },

    /// Approve a pending result
    Approve {
        /// Instance id
        id: String,

        /// Override the result status (done, needs_more, ...)
        #[arg(short, long)]
        status: Option<String>,

        /// Note recorded with the approval
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Send a phase back for another iteration
    Reject {
        /// Instance id
        id: String,

        /// Feedback for the next iteration
        reason: String,
    },

    /// Replace a pending result with one read from a YAML or JSON file
    Collaborate {
        /// Instance id
        id: String,

        /// File holding the replacement result
        file: PathBuf,
    },

    /// Re-run the current phase of a blocked instance
    Retry {
        /// Instance id
        id: String,

        /// Feedback for the re-run
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Abort an instance and everything below it
    Abort {
        /// Instance id
        id: String,
    },
}
