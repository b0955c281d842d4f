//! CLI module for loopflow - command-line interface and subcommands.
//!
//! Every command works on the saved run state: it restores the engine from
//! the snapshot file, applies the request, drives the run until it needs a
//! human again and saves the snapshot back.

pub mod commands;
pub mod components;

pub use commands::Cli;
pub use components::Components;
