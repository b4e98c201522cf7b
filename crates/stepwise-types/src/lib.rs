//! Shared domain types for Stepwise.
//!
//! This crate contains the core domain types used across the Stepwise engine:
//! workflow definitions, runs, node-runs, checkpoints, lifecycle events,
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
