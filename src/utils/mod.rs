//! Supporting utilities for the relay and the bot binary.

/// Environment-driven configuration.
pub mod config;
/// Legacy `key:value` options embedded in prompt text.
pub mod prompt_options;
