//! Loopflow - a nested phase-loop workflow engine
//!
//! Work runs through loop levels, each an ordered sequence of phases. A
//! pluggable strategy executes each phase; per-transition policies decide
//! how much autonomy a transition gets; artifacts live behind adapters for
//! whatever backend holds them. Phases can descend into a child level or
//! fork parallel children that are joined back into their parent.

pub mod adapter;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod id;
pub mod notify;
pub mod strategy;
pub mod transition;
pub mod tree;

pub use engine::{Engine, EngineBuilder, EngineHandle, EngineSnapshot, RunState, SnapshotStore};
pub use error::{EngineError, Result};
