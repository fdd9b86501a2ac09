//! # Configuration Module
//!
//! Loads, validates, and overlays the agent configuration: TOML file on disk, then
//! `VISIONOPS_`-prefixed environment variables, then field-level `validate()`.

pub mod config;

pub use config::{AgentConfig, GovernorConfig};
