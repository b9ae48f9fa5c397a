//! Configuration management module
//!
//! Loads `sa.cfg`, the agent's JSON configuration file.

mod config;

pub use config::*;
