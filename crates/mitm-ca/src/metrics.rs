use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorityMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub signing_failures: u64,
    pub cache_evictions: u64,
    pub abandoned_replies: u64,
    pub active_workers: u64,
    pub pooled_requests_allocated: u64,
    pub pooled_requests_reused: u64,
    pub pooled_requests_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct AuthorityMetricsStore {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    signing_failures: AtomicU64,
    abandoned_replies: AtomicU64,
    active_workers: AtomicU64,
}

impl AuthorityMetricsStore {
    pub(crate) fn snapshot(&self) -> AuthorityMetrics {
        AuthorityMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            signing_failures: self.signing_failures.load(Ordering::Relaxed),
            abandoned_replies: self.abandoned_replies.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Acquire),
            ..AuthorityMetrics::default()
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_leaf_issued(&self) {
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_signing_failure(&self) {
        self.signing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned_reply(&self) {
        self.abandoned_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_start(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_worker_exit(&self) {
        let _ = self
            .active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }
}
