//! In-process event distribution.
//!
//! Provides an `EventBus` that fans `WorkflowEvent` records out to all live
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
