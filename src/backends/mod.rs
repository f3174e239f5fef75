//! Backend clients.
//!
//! Every backend turns a [`GenerationRequest`] into an [`EventStream`]: a lazy,
//! finite stream of [`ProgressEvent`]s that always ends with `Completed` or
//! `Failed`. The HTTP work runs on a spawned producer task feeding a bounded
//! channel, so a slow backend never blocks the consumer.

pub mod chat;
pub mod dalle;
mod ndjson;
pub mod stable_diffusion;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use crate::relay::{BackendFailure, GenerationRequest, JobKind, ProgressEvent, StartError};

pub use chat::ChatBackend;
pub use dalle::DalleBackend;
pub use stable_diffusion::StableDiffusionBackend;

pub type EventStream = BoxStream<'static, ProgressEvent>;

/// Events buffered between the producer task and the job pump.
const EVENT_BUFFER: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with option keys a backend does not list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownOptions {
    Reject,
    PassThrough,
}

/// Static description of a backend: what it accepts and how it is shown.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub kind: JobKind,
    pub max_results: u32,
    pub allowed_options: &'static [&'static str],
    pub unknown_options: UnknownOptions,
    /// Initial status message while the job runs.
    pub status_text: &'static str,
}

impl BackendSpec {
    pub fn with_unknown_options(mut self, policy: UnknownOptions) -> Self {
        self.unknown_options = policy;
        self
    }

    /// Checks `request` against this backend and clamps its result count.
    pub fn validate(&self, request: GenerationRequest) -> Result<GenerationRequest, StartError> {
        if request.prompt().trim().is_empty() {
            return Err(StartError::InvalidRequest("the prompt is empty".to_string()));
        }

        if self.unknown_options == UnknownOptions::Reject {
            if let Some(key) = request
                .options()
                .keys()
                .find(|key| !self.allowed_options.contains(&key.as_str()))
            {
                return Err(StartError::InvalidRequest(format!(
                    "{} does not understand the option `{}`",
                    self.kind, key
                )));
            }
        }

        let count = request.count().clamp(1, self.max_results.max(1));
        if count != request.count() {
            debug!(
                "Clamped {} result count from {} to {}",
                self.kind,
                request.count(),
                count
            );
        }
        Ok(request.with_count(count))
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    fn spec(&self) -> &BackendSpec;

    /// Starts a generation. Nothing is sent until the stream is first polled.
    fn submit(&self, request: GenerationRequest) -> EventStream;

    /// Asks the backend to stop working on the current request.
    async fn cancel_remote(&self) -> Result<(), BackendFailure> {
        Ok(())
    }
}

/// Producer side of an [`EventStream`].
pub(crate) struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    /// Sends `event`; `false` means the consumer is gone and work should stop.
    pub(crate) async fn emit(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Runs `producer` on its own task once the returned stream is first polled.
///
/// `Ok(())` from the producer becomes `Completed`, an error becomes `Failed`.
/// Dropping the stream drops the producer mid-request.
pub(crate) fn event_stream<F, Fut>(kind: JobKind, producer: F) -> EventStream
where
    F: FnOnce(EventSink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BackendFailure>> + Send + 'static,
{
    stream::once(async move {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let sink = EventSink { tx: tx.clone() };
            let terminal = tokio::select! {
                result = producer(sink) => match result {
                    Ok(()) => ProgressEvent::Completed,
                    Err(failure) => {
                        warn!("{} backend failed: {}", kind, failure);
                        ProgressEvent::Failed(failure)
                    }
                },
                _ = tx.closed() => {
                    debug!("{} event stream dropped, abandoning request", kind);
                    return;
                }
            };
            let _ = tx.send(terminal).await;
        });

        ReceiverStream::new(rx)
    })
    .flatten()
    .boxed()
}

/// Shared HTTP client for every backend.
///
/// Generations can take minutes, so only connecting and each individual read
/// are bounded, never the whole request.
pub fn http_client(read_timeout: Option<Duration>) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(timeout) = read_timeout {
        builder = builder.read_timeout(timeout);
    }
    builder.build()
}

pub(crate) fn check_status(response: Response) -> Result<Response, BackendFailure> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BackendFailure::Status(status))
    }
}

/// `url` with a trailing slash, so relative joins append instead of replace.
pub(crate) fn as_directory(url: &Url) -> Url {
    let mut directory = url.clone();
    if !directory.path().ends_with('/') {
        let path = format!("{}/", directory.path());
        directory.set_path(&path);
    }
    directory
}
