//! Mock implementations of the relay collaborators

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future;
use futures::stream;
use mockall::mock;
use tokio::time::Instant;

use genrelay::backends::{BackendClient, BackendSpec, EventStream, UnknownOptions};
use genrelay::relay::{
    BackendFailure, DeliverySurface, GenerationRequest, JobKind, OutputChunk, ProgressEvent,
    StatusSurface, SurfaceHandle, SurfaceResult,
};

/// One step of a scripted backend response.
pub enum Scripted {
    Event(ProgressEvent),
    /// Waits before emitting the event.
    After(Duration, ProgressEvent),
    /// Never produces anything again.
    Hang,
}

type Script = Box<dyn Fn() -> Vec<Scripted> + Send + Sync>;

/// A backend that replays a fixed script for every submission.
pub struct ScriptedBackend {
    spec: BackendSpec,
    script: Script,
    submits: AtomicUsize,
    remote_cancels: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new<F>(kind: JobKind, script: F) -> Self
    where
        F: Fn() -> Vec<Scripted> + Send + Sync + 'static,
    {
        Self {
            spec: BackendSpec {
                kind,
                max_results: 8,
                allowed_options: &["steps"],
                unknown_options: UnknownOptions::Reject,
                status_text: "Working...",
            },
            script: Box::new(script),
            submits: AtomicUsize::new(0),
            remote_cancels: AtomicUsize::new(0),
        }
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn remote_cancels(&self) -> usize {
        self.remote_cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    fn submit(&self, _request: GenerationRequest) -> EventStream {
        self.submits.fetch_add(1, Ordering::SeqCst);

        stream::iter((self.script)())
            .then(|step| async move {
                match step {
                    Scripted::Event(event) => Some(event),
                    Scripted::After(delay, event) => {
                        tokio::time::sleep(delay).await;
                        Some(event)
                    }
                    Scripted::Hang => future::pending::<Option<ProgressEvent>>().await,
                }
            })
            .filter_map(future::ready)
            .boxed()
    }

    async fn cancel_remote(&self) -> Result<(), BackendFailure> {
        self.remote_cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    Create(u64, String),
    Update(u64, String),
    Delete(u64),
    CancelButton(u64),
    RemoveButton(u64),
}

/// A status surface that records every call with the time it was made.
#[derive(Default)]
pub struct RecordingSurface {
    next: AtomicU64,
    calls: Mutex<Vec<(Instant, SurfaceCall)>>,
    slow_create: Option<(u64, Duration)>,
}

impl RecordingSurface {
    /// Makes the create of message `id` take `delay`.
    pub fn with_slow_create(mut self, id: u64, delay: Duration) -> Self {
        self.slow_create = Some((id, delay));
        self
    }

    fn record(&self, call: SurfaceCall) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Text of every update, in order.
    pub fn updates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SurfaceCall::Update(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn update_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, call)| matches!(call, SurfaceCall::Update(..)))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn count(&self, predicate: fn(&SurfaceCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }
}

#[async_trait]
impl StatusSurface for RecordingSurface {
    async fn create(&self, text: &str) -> SurfaceResult<SurfaceHandle> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if let Some((slow_id, delay)) = self.slow_create {
            if slow_id == id {
                tokio::time::sleep(delay).await;
            }
        }
        self.record(SurfaceCall::Create(id, text.to_string()));
        Ok(SurfaceHandle::new(id))
    }

    async fn update(&self, handle: SurfaceHandle, text: &str) -> SurfaceResult<()> {
        self.record(SurfaceCall::Update(handle.get(), text.to_string()));
        Ok(())
    }

    async fn delete(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.record(SurfaceCall::Delete(handle.get()));
        Ok(())
    }

    async fn add_cancel_affordance(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.record(SurfaceCall::CancelButton(handle.get()));
        Ok(())
    }

    async fn remove_cancel_affordance(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.record(SurfaceCall::RemoveButton(handle.get()));
        Ok(())
    }
}

mock! {
    pub Delivery {}

    #[async_trait]
    impl DeliverySurface for Delivery {
        async fn deliver(&self, chunk: &OutputChunk) -> SurfaceResult<()>;
    }
}
