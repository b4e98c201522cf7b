//! Infrastructure layer for Stepwise.
//!
//! Implements the ports defined in `stepwise-core`: SQLite storage for
//! definitions, runs, node-runs, and events; the TOML configuration loader;
//! and the Anthropic-backed agent prompt executor.

pub mod agent;
pub mod config;
pub mod sqlite;
