//! Generation orchestration for a node-based media canvas.
//!
//! [`core`] holds the graph model, readiness analysis, collection
//! population, provider dispatch and the two run modes. [`cli`] drives them
//! against a graph document on disk.

pub mod cli;
pub mod core;
pub mod logging;
