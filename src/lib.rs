//! Relays prompts from chat commands to slow generative-AI backends.
//!
//! The crate is split the same way the bot is wired together:
//!
//! * [`backends`] talks HTTP to the text and image services and turns their
//!   responses into a stream of [`relay::ProgressEvent`]s.
//! * [`relay`] drives one of those streams to a single terminal outcome,
//!   throttling status updates and chunking the result for delivery.
//! * [`utils`] holds configuration loading and the legacy inline option parser.

/// Backend clients for the chat, DALL-E mini and Stable Diffusion services.
pub mod backends;
/// The job relay: controller, throttle, chunker and error classification.
pub mod relay;
/// Configuration and prompt helpers shared by the command layer.
pub mod utils;
