//! This module aggregates all the command modules for the bot.

/// Commands that relay prompts to generative-AI backends.
pub(crate) mod ai;
