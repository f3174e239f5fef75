//! Hands finished chunks to the transport that posts them.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::chunker::OutputChunk;
use super::surface::SurfaceResult;

#[async_trait]
pub trait DeliverySurface: Send + Sync {
    async fn deliver(&self, chunk: &OutputChunk) -> SurfaceResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Delivers every chunk in order. A failed chunk is logged and skipped; the
/// rest are still attempted.
pub async fn deliver_all<D>(surface: &D, chunks: &[OutputChunk]) -> DeliveryReport
where
    D: DeliverySurface + ?Sized,
{
    let mut report = DeliveryReport::default();

    for (position, chunk) in chunks.iter().enumerate() {
        match surface.deliver(chunk).await {
            Ok(()) => {
                debug!("Delivered chunk {}/{}", position + 1, chunks.len());
                report.delivered += 1;
            }
            Err(e) => {
                warn!("Failed to deliver chunk {}/{}: {}", position + 1, chunks.len(), e);
                report.failed += 1;
            }
        }
    }

    report
}
