//! Workflow engine core: definitions, versioning, and durable execution.
//!
//! - `definition` -- YAML/JSON loading, validation, edge compilation
//! - `versioning` -- immutable versions with draft/published alias pointers
//! - `template` -- `{{ path }}` placeholder resolution
//! - `expression` -- condition DSL (`not`, `eq`, `contains`, truthiness)
//! - `retry` -- retry profiles, policy resolution, backoff with jitter
//! - `agent` -- agent prompt executor port
//! - `node_runner` -- per-type node dispatch
//! - `checkpoint` -- node-run rows and run-level checkpoints
//! - `engine` -- the sequential graph walker

pub mod agent;
pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod node_runner;
pub mod retry;
pub mod template;
pub mod versioning;
