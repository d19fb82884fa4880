//! Pool of schedulers and the caller-facing request handle

use super::{unregister, Registry, Scheduler};
use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::raid::request::{RaidRequest, RequestContext, SharedRequest};
use crate::raid::{RequestId, RequestParams, RequestStats};
use crate::transport::Transport;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Identifies a submitted request and the scheduler that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub scheduler: usize,
    pub id: RequestId,
}

/// Load-balances retrieval requests over a fixed set of schedulers
pub struct SchedulerGroup {
    schedulers: Vec<Scheduler>,
    transport: Arc<dyn Transport>,
    metrics: Arc<EngineMetrics>,
    engine: EngineConfig,
    next_id: AtomicU64,
}

impl SchedulerGroup {
    /// Start `config.scheduler.workers` schedulers sharing `transport`
    pub fn start(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let schedulers = (0..config.scheduler.workers)
            .map(Scheduler::spawn)
            .collect::<Result<Vec<_>>>()?;

        info!("started {} schedulers", schedulers.len());

        Ok(SchedulerGroup {
            schedulers,
            transport,
            metrics: Arc::new(EngineMetrics::new()),
            engine: config.engine.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start a request on the least loaded scheduler
    pub fn submit(&self, params: RequestParams) -> Result<RequestHandle> {
        let (index, scheduler) = self
            .schedulers
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.load())
            .ok_or_else(|| Error::Internal("no schedulers running".to_string()))?;

        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = RequestContext {
            id,
            queue: scheduler.queue().clone(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            config: self.engine.clone(),
        };

        let request = RaidRequest::new(&params, context)?;
        let shared = Arc::new(SharedRequest::new(request));

        // registered before any fetcher is triggered so no task is dropped
        scheduler.register(shared.clone());
        shared.start();

        debug!("request {} assigned to scheduler {}", id, index);

        Ok(RequestHandle {
            token: RequestToken {
                scheduler: index,
                id,
            },
            shared,
            registry: scheduler.registry(),
            wake_interval: self.engine.reader_wake(),
        })
    }

    /// Disconnect every shard of a request and drop its state.
    ///
    /// Dropping the handle does the same; this variant reports whether
    /// the request was still registered.
    pub fn remove(&self, handle: RequestHandle) -> bool {
        let removed = self
            .schedulers
            .get(handle.token.scheduler)
            .map(|s| s.remove(handle.token.id))
            .unwrap_or(false);

        if removed {
            debug!("request {} removed", handle.token.id);
        }
        removed
    }

    /// Requests currently registered across all schedulers
    pub fn active_requests(&self) -> usize {
        self.schedulers.iter().map(Scheduler::load).sum()
    }

    pub fn scheduler_count(&self) -> usize {
        self.schedulers.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Log the engine counters
    pub fn report_metrics(&self) {
        self.metrics.report();
    }
}

/// Caller side of a running request.
///
/// The request stays registered with its scheduler until the handle is
/// passed to [`SchedulerGroup::remove`] or dropped.
pub struct RequestHandle {
    token: RequestToken,
    shared: Arc<SharedRequest>,
    registry: Weak<Registry>,
    wake_interval: Duration,
}

impl RequestHandle {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Copy out whatever is ready without waiting.
    ///
    /// Returns `Ok(0)` when nothing is ready yet or the range is exhausted.
    pub fn consume(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.consume(buf)
    }

    /// Wait for data and copy it into `buf`. `Ok(0)` marks the end of the range.
    pub fn read_data(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.shared.wait_for(self.wake_interval, |request, now| {
            request.consume_into(buf, now)
        })
    }

    /// Wait for data and write up to `max_len` bytes of it to `out`.
    ///
    /// `Ok(0)` marks the end of the range. A writer that accepts no bytes
    /// fails with [`std::io::ErrorKind::WriteZero`].
    pub fn send_data<W: Write>(&self, out: &mut W, max_len: usize) -> Result<usize> {
        if max_len == 0 {
            return Ok(0);
        }
        self.shared.wait_for(self.wake_interval, |request, now| {
            request.consume_with(max_len, now, |bytes| out.write(bytes))
        })
    }

    /// Bytes of the range not yet delivered
    pub fn remaining(&self) -> u64 {
        self.shared.stats().remaining
    }

    /// True once the whole range was delivered
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn stats(&self) -> RequestStats {
        self.shared.stats()
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if unregister(&registry, self.token.id) {
            debug!("request {} released by its handle", self.token.id);
        }
    }
}

impl Read for RequestHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_data(buf)?)
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("token", &self.token).finish()
    }
}
