//! Agent prompt executor implementations.

pub mod anthropic;

pub use anthropic::AnthropicAgent;
