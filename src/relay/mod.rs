//! The job relay core.
//!
//! A job is one [`GenerationRequest`] submitted to a backend. The
//! [`JobController`] consumes the backend's [`ProgressEvent`] stream on its own
//! task, pushes throttled progress to a [`StatusSurface`] and finally reports
//! exactly one [`Outcome`].

pub mod admission;
pub mod chunker;
pub mod classifier;
pub mod controller;
pub mod delivery;
pub mod surface;
pub mod throttle;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

pub use admission::{AdmissionLimiter, AdmissionPermit};
pub use chunker::{ChunkContent, ChunkLimits, OutputChunk, PROMPT_EXCERPT_CHARS, excerpt};
pub use classifier::{BackendFailure, ErrorCategory, classify};
pub use controller::{JobControl, JobController, JobHandle, JobId, Outcome, RelaySettings, StartError};
pub use delivery::{DeliveryReport, DeliverySurface, deliver_all};
pub use surface::{StatusSurface, SurfaceError, SurfaceHandle, SurfaceResult};
pub use throttle::ProgressThrottle;

/// The families of backend a job can run against.
///
/// Admission limits are counted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Chat,
    Dalle,
    StableDiffusion,
}

impl JobKind {
    /// Human readable name used in titles and log lines.
    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::Chat => "ChatGPT",
            JobKind::Dalle => "Dall-E Mini",
            JobKind::StableDiffusion => "Stable Diffusion",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A prompt plus backend option overrides and the number of results wanted.
///
/// Built with the consuming `with_*` methods; once handed to a controller it
/// is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    options: BTreeMap<String, String>,
    count: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: BTreeMap::new(),
            count: 1,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.options
            .extend(options.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// The payload of a single generated result.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Image(Vec<u8>),
    Text(String),
}

/// One generated result unit, identified by its position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub index: usize,
    pub payload: ArtifactPayload,
    pub seed: Option<i64>,
    pub config: Option<Value>,
}

impl Artifact {
    pub fn image(index: usize, bytes: Vec<u8>) -> Self {
        Self {
            index,
            payload: ArtifactPayload::Image(bytes),
            seed: None,
            config: None,
        }
    }

    pub fn text(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            payload: ArtifactPayload::Text(text.into()),
            seed: None,
            config: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: Option<Value>) -> Self {
        self.config = config;
        self
    }

    /// Attachment file name, e.g. `3.png`.
    pub fn file_name(&self) -> String {
        match self.payload {
            ArtifactPayload::Image(_) => format!("{}.png", self.index),
            ArtifactPayload::Text(_) => format!("{}.txt", self.index),
        }
    }
}

/// Incremental events produced by a backend client, in order.
///
/// `Completed` or `Failed` is always the last event of a stream.
#[derive(Debug)]
pub enum ProgressEvent {
    /// Newly produced text, appended to what came before.
    TextDelta(String),
    StepTick { completed: u32, total: u32 },
    ArtifactReady(Artifact),
    Failed(BackendFailure),
    Completed,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Failed(_) | ProgressEvent::Completed)
    }
}

/// Lifecycle of a job. The last three states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Cancelled | JobState::Failed
        )
    }
}
