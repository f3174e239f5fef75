//! Per-kind admission control.
//!
//! Each [`JobKind`] has a cap on concurrently running jobs. Admission is a
//! compare-and-increment on an atomic counter, so concurrent `start` calls
//! can never push a kind past its limit. The returned [`AdmissionPermit`]
//! gives the slot back when dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::JobKind;

#[derive(Debug)]
pub struct AdmissionLimiter {
    default_limit: usize,
    limits: HashMap<JobKind, usize>,
    active: DashMap<JobKind, Arc<AtomicUsize>>,
}

impl AdmissionLimiter {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            limits: HashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn with_limit(mut self, kind: JobKind, limit: usize) -> Self {
        self.limits.insert(kind, limit);
        self
    }

    pub fn limit(&self, kind: JobKind) -> usize {
        self.limits.get(&kind).copied().unwrap_or(self.default_limit)
    }

    /// Jobs of `kind` currently holding a permit.
    pub fn active(&self, kind: JobKind) -> usize {
        self.active
            .get(&kind)
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    /// Claims a slot for `kind`, or returns the limit that is already full.
    pub fn try_admit(&self, kind: JobKind) -> Result<AdmissionPermit, usize> {
        let limit = self.limit(kind);
        let counter = self.active.entry(kind).or_default().clone();

        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < limit).then_some(running + 1)
            })
            .map(|previous| {
                debug!("Admitted {} job ({}/{})", kind, previous + 1, limit);
                AdmissionPermit { kind, counter }
            })
            .map_err(|_| limit)
    }
}

/// A claimed slot. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    kind: JobKind,
    counter: Arc<AtomicUsize>,
}

impl AdmissionPermit {
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug!("Released {} job slot ({} remaining)", self.kind, previous - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn rejects_once_the_limit_is_reached() {
        let limiter = AdmissionLimiter::new(1).with_limit(JobKind::StableDiffusion, 3);

        let permits: Vec<_> = (0..3)
            .map(|_| limiter.try_admit(JobKind::StableDiffusion).unwrap())
            .collect();

        assert_matches!(limiter.try_admit(JobKind::StableDiffusion), Err(3));
        assert_eq!(limiter.active(JobKind::StableDiffusion), 3);
        drop(permits);
        assert_eq!(limiter.active(JobKind::StableDiffusion), 0);
    }

    #[test]
    fn kinds_are_counted_independently() {
        let limiter = AdmissionLimiter::new(1);

        let _chat = limiter.try_admit(JobKind::Chat).unwrap();

        assert!(limiter.try_admit(JobKind::Chat).is_err());
        assert!(limiter.try_admit(JobKind::Dalle).is_ok());
    }

    #[test]
    fn dropping_a_permit_frees_the_slot() {
        let limiter = AdmissionLimiter::new(1);

        let permit = limiter.try_admit(JobKind::Dalle).unwrap();
        assert_eq!(permit.kind(), JobKind::Dalle);
        drop(permit);

        assert!(limiter.try_admit(JobKind::Dalle).is_ok());
    }

    #[test]
    fn concurrent_admissions_never_exceed_the_limit() {
        let limiter = Arc::new(AdmissionLimiter::new(3));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || limiter.try_admit(JobKind::Chat).ok())
            })
            .collect();
        let permits: Vec<AdmissionPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), 3);
        assert_eq!(limiter.active(JobKind::Chat), 3);
    }
}
