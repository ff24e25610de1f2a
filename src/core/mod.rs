pub mod autosave;
pub mod collections;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod handoff;
pub mod orchestrator;
pub mod provider;
pub mod readiness;
pub mod terminal;
