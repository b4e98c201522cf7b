//! Business logic and repository trait definitions for Stepwise.
//!
//! This crate defines the "ports" (repository traits, agent executor) that the
//! infrastructure layer implements. It depends only on `stepwise-types` --
//! never on `stepwise-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
