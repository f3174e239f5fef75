//! The status surface collaborator and the board that drives it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

pub type SurfaceError = Box<dyn std::error::Error + Send + Sync>;
pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Opaque reference to one status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Where in-flight progress is shown, e.g. an editable chat message.
#[async_trait]
pub trait StatusSurface: Send + Sync {
    async fn create(&self, text: &str) -> SurfaceResult<SurfaceHandle>;
    async fn update(&self, handle: SurfaceHandle, text: &str) -> SurfaceResult<()>;
    async fn delete(&self, handle: SurfaceHandle) -> SurfaceResult<()>;
    async fn add_cancel_affordance(&self, handle: SurfaceHandle) -> SurfaceResult<()>;

    /// Takes the cancel control off a message once the job is over.
    async fn remove_cancel_affordance(&self, _handle: SurfaceHandle) -> SurfaceResult<()> {
        Ok(())
    }
}

/// Reports whether the job has stopped relaying.
pub(crate) type StopCheck = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct StatusUnit {
    handle: SurfaceHandle,
    /// Character offset of the accumulated text this unit starts at.
    start: usize,
    has_button: bool,
}

/// Tracks the status messages of one job.
///
/// Text longer than `char_limit` spills into a fresh message instead of being
/// truncated; earlier messages keep the full slice they were responsible for.
/// Surface failures are logged and never abort the job. Once `stopped`
/// reports true the board makes no further creates or updates.
pub(crate) struct StatusBoard {
    surface: Arc<dyn StatusSurface>,
    units: Vec<StatusUnit>,
    char_limit: usize,
    cancellable: bool,
    stopped: StopCheck,
}

impl StatusBoard {
    pub(crate) async fn open(
        surface: Arc<dyn StatusSurface>,
        initial: &str,
        char_limit: usize,
        cancellable: bool,
        stopped: StopCheck,
    ) -> Self {
        let mut board = Self {
            surface,
            units: Vec::new(),
            char_limit: char_limit.max(1),
            cancellable,
            stopped,
        };
        board.open_unit(initial, 0).await;
        board
    }

    async fn open_unit(&mut self, text: &str, start: usize) -> bool {
        if (self.stopped)() {
            return false;
        }
        let handle = match self.surface.create(text).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to create status message: {}", e);
                return false;
            }
        };

        let mut unit = StatusUnit {
            handle,
            start,
            has_button: false,
        };
        if self.cancellable && !(self.stopped)() {
            match self.surface.add_cancel_affordance(handle).await {
                Ok(()) => unit.has_button = true,
                Err(e) => warn!("Failed to attach cancel button to status message: {}", e),
            }
        }

        debug!("Opened status message {} at offset {}", handle.get(), start);
        self.units.push(unit);
        !(self.stopped)()
    }

    /// Opens new units until the tail of `text` fits the current one.
    pub(crate) async fn roll_over(&mut self, text: &str) {
        let total = text.chars().count();

        while let Some(current) = self.units.last().copied() {
            if total - current.start.min(total) <= self.char_limit {
                return;
            }

            let full: String = text
                .chars()
                .skip(current.start)
                .take(self.char_limit)
                .collect();
            self.push(current.handle, &full).await;

            let next_start = current.start + self.char_limit;
            let next: String = text
                .chars()
                .skip(next_start)
                .take(self.char_limit)
                .collect();
            if !self.open_unit(&next, next_start).await {
                return;
            }
        }
    }

    /// The part of `text` the current unit is responsible for.
    pub(crate) fn tail(&self, text: &str) -> String {
        let start = self.units.last().map_or(0, |unit| unit.start);
        text.chars().skip(start).collect()
    }

    /// Replaces the content of the current unit.
    pub(crate) async fn show(&self, display: &str) {
        if let Some(current) = self.units.last() {
            self.push(current.handle, display).await;
        }
    }

    async fn push(&self, handle: SurfaceHandle, text: &str) {
        if (self.stopped)() {
            debug!("Skipping update of status message {} after stop", handle.get());
            return;
        }
        if let Err(e) = self.surface.update(handle, text).await {
            warn!("Failed to update status message {}: {}", handle.get(), e);
        }
    }

    /// Removes the cancel buttons still showing. Runs after the job settles.
    pub(crate) async fn retire(&mut self) {
        for unit in self.units.iter_mut().filter(|unit| unit.has_button) {
            match self.surface.remove_cancel_affordance(unit.handle).await {
                Ok(()) => unit.has_button = false,
                Err(e) => warn!(
                    "Failed to remove cancel button from status message {}: {}",
                    unit.handle.get(),
                    e
                ),
            }
        }
    }

    /// Deletes every status message this board opened.
    pub(crate) async fn clear(&mut self) {
        for unit in self.units.drain(..) {
            if let Err(e) = self.surface.delete(unit.handle).await {
                warn!("Failed to delete status message {}: {}", unit.handle.get(), e);
            }
        }
    }
}
