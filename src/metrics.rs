//! Engine-wide counters
//!
//! One `EngineMetrics` is owned by a `SchedulerGroup` and shared with
//! every request it starts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    connections: AtomicU64,
    request_errors: AtomicU64,
    bytes_received: AtomicU64,
    bytes_delivered: AtomicU64,
    readahead_chunks: AtomicU64,
    readahead_peak: AtomicU64,
    fast_requests: AtomicU64,
    slow_requests: AtomicU64,
    watchdog_switches: AtomicU64,
    lag_switches: AtomicU64,
    exhausted_sources: AtomicU64,
    failed_transfers: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub request_errors: u64,
    pub bytes_received: u64,
    pub bytes_delivered: u64,
    pub readahead_chunks: u64,
    pub readahead_peak: u64,
    pub fast_requests: u64,
    pub slow_requests: u64,
    pub watchdog_switches: u64,
    pub lag_switches: u64,
    pub exhausted_sources: u64,
    pub failed_transfers: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            connections: load(&self.connections),
            request_errors: load(&self.request_errors),
            bytes_received: load(&self.bytes_received),
            bytes_delivered: load(&self.bytes_delivered),
            readahead_chunks: load(&self.readahead_chunks),
            readahead_peak: load(&self.readahead_peak),
            fast_requests: load(&self.fast_requests),
            slow_requests: load(&self.slow_requests),
            watchdog_switches: load(&self.watchdog_switches),
            lag_switches: load(&self.lag_switches),
            exhausted_sources: load(&self.exhausted_sources),
            failed_transfers: load(&self.failed_transfers),
        }
    }

    /// Log the current counters
    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            "requests fast/slow {}/{}, connections {}, errors {}, received {} bytes, delivered {} bytes, readahead {} (peak {}), watchdog {}, lag {}, exhausted {}, failed {}",
            s.fast_requests,
            s.slow_requests,
            s.connections,
            s.request_errors,
            s.bytes_received,
            s.bytes_delivered,
            s.readahead_chunks,
            s.readahead_peak,
            s.watchdog_switches,
            s.lag_switches,
            s.exhausted_sources,
            s.failed_transfers
        );
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_failed(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, bytes: usize) {
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Replace one request's share of buffered readahead chunks
    pub(crate) fn readahead_changed(&self, before: usize, after: usize) {
        if after >= before {
            let added = (after - before) as u64;
            let now = self.readahead_chunks.fetch_add(added, Ordering::Relaxed) + added;
            self.readahead_peak.fetch_max(now, Ordering::Relaxed);
        } else {
            self.readahead_chunks
                .fetch_sub((before - after) as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn request_started(&self) {
        self.fast_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_finished(&self, slow: bool) {
        self.mode_counter(slow).fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn mode_changed(&self, slow: bool) {
        self.mode_counter(!slow).fetch_sub(1, Ordering::Relaxed);
        self.mode_counter(slow).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn watchdog_switch(&self) {
        self.watchdog_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lag_switch(&self) {
        self.lag_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn source_exhausted(&self) {
        self.exhausted_sources.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transfer_failed(&self) {
        self.failed_transfers.fetch_add(1, Ordering::Relaxed);
    }

    fn mode_counter(&self, slow: bool) -> &AtomicU64 {
        if slow {
            &self.slow_requests
        } else {
            &self.fast_requests
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_counters() {
        let metrics = EngineMetrics::new();
        metrics.request_started();
        metrics.request_started();
        metrics.mode_changed(true);

        let s = metrics.snapshot();
        assert_eq!((s.fast_requests, s.slow_requests), (1, 1));

        metrics.request_finished(true);
        metrics.request_finished(false);
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_readahead_peak() {
        let metrics = EngineMetrics::new();
        metrics.readahead_changed(0, 5);
        metrics.readahead_changed(5, 2);
        metrics.readahead_changed(2, 3);

        let s = metrics.snapshot();
        assert_eq!(s.readahead_chunks, 3);
        assert_eq!(s.readahead_peak, 5);
    }
}
