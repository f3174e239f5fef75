//! The job state machine.
//!
//! `Pending -> Running -> {Succeeded, Cancelled, Failed}`. A job runs on its
//! own tokio task (the event pump) and reaches exactly one terminal state.
//! Cancellation and timeouts are observed cooperatively at the point where
//! the pump waits for the next backend event.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use super::chunker::{self, ChunkLimits, OutputChunk, PROMPT_EXCERPT_CHARS, excerpt};
use super::classifier::{BackendFailure, ErrorCategory, classify};
use super::surface::{StatusBoard, StatusSurface};
use super::throttle::{DEFAULT_UPDATE_INTERVAL, ProgressThrottle};
use super::{AdmissionLimiter, AdmissionPermit, Artifact, GenerationRequest, JobKind, JobState, ProgressEvent};
use crate::backends::BackendClient;

/// Discord's per-message character cap.
pub const DEFAULT_STATUS_CHAR_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Minimum time between two status updates.
    pub update_interval: Duration,
    /// Characters a single status message may hold before spilling over.
    pub status_char_limit: usize,
    pub chunk_limits: ChunkLimits,
    /// Maximum job duration. `None` lets a job run until the backend finishes.
    pub timeout: Option<Duration>,
    /// Attach a cancel button to status messages.
    pub cancellable: bool,
    pub clear_status_on_success: bool,
    /// Delete status messages when a job is cancelled or times out.
    pub clear_status_on_cancel: bool,
    /// Upper bound for the fire-and-forget remote cancel call.
    pub remote_cancel_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            status_char_limit: DEFAULT_STATUS_CHAR_LIMIT,
            chunk_limits: ChunkLimits::default(),
            timeout: None,
            cancellable: true,
            clear_status_on_success: false,
            clear_status_on_cancel: false,
            remote_cancel_timeout: Duration::from_secs(5),
        }
    }
}

/// Reasons a job is refused before any backend call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Too many {kind} jobs are running (limit {limit})")]
    Overloaded { kind: JobKind, limit: usize },
}

impl StartError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StartError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            StartError::Overloaded { .. } => ErrorCategory::Overloaded,
        }
    }
}

/// The single result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded {
        chunks: Vec<OutputChunk>,
        elapsed: Duration,
    },
    Cancelled,
    Failed {
        category: ErrorCategory,
        detail: String,
    },
}

impl Outcome {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Outcome::Failed { category, .. } => Some(*category),
            _ => None,
        }
    }
}

impl From<StartError> for Outcome {
    fn from(error: StartError) -> Self {
        Outcome::Failed {
            category: error.category(),
            detail: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug)]
struct ControlInner {
    state: watch::Sender<JobState>,
    cancel_requested: AtomicBool,
    cancel_signal: Notify,
}

/// Cloneable control over a running job: state queries and cancellation.
#[derive(Debug, Clone)]
pub struct JobControl {
    inner: Arc<ControlInner>,
}

impl JobControl {
    fn new() -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            inner: Arc::new(ControlInner {
                state,
                cancel_requested: AtomicBool::new(false),
                cancel_signal: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.borrow()
    }

    /// Requests cancellation. Returns whether the request was accepted.
    ///
    /// Only a running job can be cancelled; repeated calls and calls after a
    /// terminal state are no-ops. The check runs under the state lock, so a
    /// job can never be both accepted for cancellation and reported as
    /// succeeded.
    pub fn cancel(&self) -> bool {
        let mut accepted = false;
        self.inner.state.send_if_modified(|state| {
            if *state == JobState::Running
                && !self.inner.cancel_requested.swap(true, Ordering::AcqRel)
            {
                accepted = true;
            }
            false
        });

        if accepted {
            self.inner.cancel_signal.notify_one();
        }
        accepted
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub async fn wait_terminal(&self) -> JobState {
        let mut receiver = self.inner.state.subscribe();
        match receiver.wait_for(JobState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn begin(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == JobState::Pending {
                *state = JobState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Moves to a terminal state exactly once and returns the state reached.
    ///
    /// An accepted cancellation wins over whatever the pump asks for.
    fn settle(&self, requested: JobState) -> JobState {
        let mut settled = requested;
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                settled = *state;
                return false;
            }
            if self.inner.cancel_requested.load(Ordering::Acquire) {
                settled = JobState::Cancelled;
            }
            *state = settled;
            true
        });
        settled
    }

    async fn cancelled(&self) {
        self.inner.cancel_signal.notified().await
    }
}

/// A started job. Await [`JobHandle::outcome`] for the result.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    kind: JobKind,
    control: JobControl,
    task: JoinHandle<Outcome>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.control.state()
    }

    pub fn control(&self) -> JobControl {
        self.control.clone()
    }

    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Suspends until the job is terminal. Never panics: a crashed pump is
    /// reported as an unknown failure.
    pub async fn outcome(self) -> Outcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} event pump died: {}", self.id, e);
                match self.control.settle(JobState::Failed) {
                    JobState::Cancelled => Outcome::Cancelled,
                    _ => Outcome::Failed {
                        category: ErrorCategory::Unknown,
                        detail: format!("job task failed: {e}"),
                    },
                }
            }
        }
    }
}

/// Starts jobs against one backend.
pub struct JobController {
    backend: Arc<dyn BackendClient>,
    admission: Arc<AdmissionLimiter>,
    settings: RelaySettings,
    next_id: AtomicU64,
}

impl JobController {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        admission: Arc<AdmissionLimiter>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            backend,
            admission,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.backend.spec().kind
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Validates and admits `request`, then starts relaying it on a new task.
    ///
    /// Invalid and over-limit requests are refused here without touching the
    /// backend.
    pub fn start(
        &self,
        request: GenerationRequest,
        surface: Arc<dyn StatusSurface>,
    ) -> Result<JobHandle, StartError> {
        let spec = self.backend.spec();
        let kind = spec.kind;

        let request = spec.validate(request).inspect_err(|e| {
            warn!("Rejected {} request: {}", kind, e);
        })?;

        let permit = self.admission.try_admit(kind).map_err(|limit| {
            warn!("Rejected {} request: {} jobs already running", kind, limit);
            StartError::Overloaded { kind, limit }
        })?;

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let control = JobControl::new();
        control.begin();

        info!(
            "Starting {} on {} for prompt '{}' ({} result(s))",
            id,
            kind,
            request.prompt(),
            request.count()
        );

        let pump = EventPump {
            id,
            backend: self.backend.clone(),
            settings: self.settings.clone(),
            control: control.clone(),
            surface,
            request,
            _permit: permit,
        };
        let task = tokio::spawn(pump.run());

        Ok(JobHandle {
            id,
            kind,
            control,
            task,
        })
    }

    /// Same as [`JobHandle::cancel`].
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        handle.cancel()
    }

    /// Same as [`JobHandle::outcome`].
    pub async fn await_outcome(&self, handle: JobHandle) -> Outcome {
        handle.outcome().await
    }
}

enum Step {
    Cancel,
    Timeout,
    Event(Option<ProgressEvent>),
}

enum Ending {
    Completed,
    Cancelled,
    TimedOut,
    Failed(BackendFailure),
}

struct EventPump {
    id: JobId,
    backend: Arc<dyn BackendClient>,
    settings: RelaySettings,
    control: JobControl,
    surface: Arc<dyn StatusSurface>,
    request: GenerationRequest,
    _permit: AdmissionPermit,
}

impl EventPump {
    async fn run(self) -> Outcome {
        let started = Instant::now();
        let deadline = self.settings.timeout.map(|limit| started + limit);

        let control = self.control.clone();
        let mut board = StatusBoard::open(
            self.surface.clone(),
            self.backend.spec().status_text,
            self.settings.status_char_limit,
            self.settings.cancellable,
            Box::new(move || control.is_cancel_requested()),
        )
        .await;
        let mut throttle = ProgressThrottle::new(self.settings.update_interval);
        let mut text = String::new();
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut events = self.backend.submit(self.request.clone());

        let ending = loop {
            let step = tokio::select! {
                biased;
                _ = self.control.cancelled() => Step::Cancel,
                _ = expire(deadline) => Step::Timeout,
                event = events.next() => Step::Event(event),
            };

            let event = match step {
                Step::Cancel => break Ending::Cancelled,
                Step::Timeout => break Ending::TimedOut,
                Step::Event(None) => break Ending::Failed(BackendFailure::Truncated),
                Step::Event(Some(event)) => event,
            };
            if self.control.is_cancel_requested() {
                break Ending::Cancelled;
            }

            match event {
                ProgressEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    board.roll_over(&text).await;
                    if self.control.is_cancel_requested() {
                        break Ending::Cancelled;
                    }
                    if throttle.should_emit(Instant::now(), board.tail(&text)) {
                        if let Some(display) = throttle.latest() {
                            board.show(display).await;
                        }
                    }
                }
                ProgressEvent::StepTick { completed, total } => {
                    debug!("{} step {}/{}", self.id, completed, total);
                    let display = format!("Running... {completed}/{total}");
                    if throttle.should_emit(Instant::now(), display) {
                        if let Some(display) = throttle.latest() {
                            board.show(display).await;
                        }
                    }
                }
                ProgressEvent::ArtifactReady(artifact) => {
                    debug!("{} received artifact {}", self.id, artifact.index);
                    artifacts.push(artifact);
                }
                ProgressEvent::Completed => break Ending::Completed,
                ProgressEvent::Failed(failure) => break Ending::Failed(failure),
            }
        };
        drop(events);

        let requested = match ending {
            Ending::Completed => JobState::Succeeded,
            Ending::Cancelled => JobState::Cancelled,
            Ending::TimedOut | Ending::Failed(_) => JobState::Failed,
        };
        let settled = self.control.settle(requested);
        let elapsed = started.elapsed();

        let outcome = match (settled, ending) {
            (JobState::Cancelled, _) | (_, Ending::Cancelled) => {
                info!("{} cancelled after {:.1}s", self.id, elapsed.as_secs_f64());
                self.abandon(&mut board).await;
                Outcome::Cancelled
            }
            (_, Ending::TimedOut) => {
                warn!("{} timed out after {:.1}s", self.id, elapsed.as_secs_f64());
                self.abandon(&mut board).await;
                Outcome::Failed {
                    category: ErrorCategory::Timeout,
                    detail: format!("no result after {:.0}s", elapsed.as_secs_f64()),
                }
            }
            (_, Ending::Failed(failure)) => {
                let category = classify(&failure);
                error!("{} failed ({}): {}", self.id, category, failure);
                flush(&mut board, &mut throttle).await;
                Outcome::Failed {
                    category,
                    detail: failure.to_string(),
                }
            }
            (_, Ending::Completed) => {
                if self.settings.clear_status_on_success {
                    board.clear().await;
                } else {
                    flush(&mut board, &mut throttle).await;
                }

                artifacts.sort_by_key(|artifact| artifact.index);
                info!(
                    "{} succeeded in {:.1}s with {} char(s) and {} artifact(s)",
                    self.id,
                    elapsed.as_secs_f64(),
                    text.chars().count(),
                    artifacts.len()
                );

                let caption = caption(self.request.prompt(), elapsed);
                let chunks = chunker::chunk(&text, artifacts, self.settings.chunk_limits, &caption);
                Outcome::Succeeded { chunks, elapsed }
            }
        };

        board.retire().await;
        outcome
    }

    /// Stops relaying: tells the backend (without waiting) and optionally
    /// removes the status messages.
    async fn abandon(&self, board: &mut StatusBoard) {
        let backend = self.backend.clone();
        let limit = self.settings.remote_cancel_timeout;
        let id = self.id;
        tokio::spawn(async move {
            match timeout(limit, backend.cancel_remote()).await {
                Ok(Ok(())) => debug!("{} remote cancel delivered", id),
                Ok(Err(e)) => warn!("{} remote cancel failed: {}", id, e),
                Err(_) => warn!("{} remote cancel timed out after {:?}", id, limit),
            }
        });

        if self.settings.clear_status_on_cancel {
            board.clear().await;
        }
    }
}

/// Caption for delivered results. Long prompts are cut so it fits in embeds.
fn caption(prompt: &str, elapsed: Duration) -> String {
    format!(
        "Results for: {} ({:.1}s)",
        excerpt(prompt, PROMPT_EXCERPT_CHARS),
        elapsed.as_secs_f64()
    )
}

/// Pushes the latest held-back display, so the final state is never missed.
async fn flush(board: &mut StatusBoard, throttle: &mut ProgressThrottle<String>) {
    if !throttle.has_pending() {
        return;
    }
    if let Some(latest) = throttle.latest().cloned() {
        throttle.finish(Instant::now(), latest);
        if let Some(display) = throttle.latest() {
            board.show(display).await;
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
