//! Retrieval requests
//!
//! A [`RaidRequest`] reconstructs one byte range of a striped file. Its
//! shard fetchers are stepped by a scheduler thread while the reader
//! consumes reconstructed lines from the front of the buffer. Both sides
//! go through [`SharedRequest`], which pairs the state with a condvar the
//! reader waits on.

use super::buffer::ReconstructionBuffer;
use super::fetcher::{FetchState, ShardFetcher};
use super::{
    buffer_lines, padded_part_size, raid_part_size, DATA_PARTS, LAG_DOMINANCE, LAG_INTERVAL,
    RAIDLINE, RAIDPARTS, RAIDSECTOR,
};
use crate::config::EngineConfig;
use crate::error::{Error, Failure, Result};
use crate::metrics::EngineMetrics;
use crate::scheduler::{Task, WorkQueue};
use crate::transport::{Demotion, ExponentialBackoff, Transport};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Consecutive errors after which a source no longer counts as a good substitute
const MAX_IDLE_ERRORS: u32 = 3;

/// Identifier of a request within its scheduler group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        RequestId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fetch mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    /// Five shards fetch freely, the sixth stays parked
    Fast,
    /// The two named shards fetch bounded windows, the rest fetch freely
    Slow(usize, usize),
}

impl Mode {
    /// True if `part` is one of the slow pair
    pub fn is_slow(&self, part: usize) -> bool {
        matches!(*self, Mode::Slow(a, b) if a == part || b == part)
    }

    pub fn slow_parts(&self) -> Option<[usize; 2]> {
        match *self {
            Mode::Fast => None,
            Mode::Slow(a, b) => Some([a, b]),
        }
    }
}

/// What to retrieve and where the shards live
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub filesize: u64,
    /// Plaintext offset of the first byte to deliver
    pub start: u64,
    /// Number of bytes to deliver
    pub reqlen: u64,
    /// Source of each shard, parity first; None when the shard is lost
    pub shard_urls: [Option<String>; RAIDPARTS],
    pub created_at: DateTime<Utc>,
}

impl RequestParams {
    /// Retrieve the whole file from six shard URLs, parity first.
    ///
    /// An empty URL marks a missing shard; at most one may be missing.
    pub fn new<I, S>(filesize: u64, urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut urls: Vec<Option<String>> = urls
            .into_iter()
            .map(Into::into)
            .map(|url: String| (!url.is_empty()).then_some(url))
            .collect();

        if urls.len() != RAIDPARTS {
            return Err(Error::Config(format!(
                "expected {} shard URLs, got {}",
                RAIDPARTS,
                urls.len()
            )));
        }

        let params = RequestParams {
            filesize,
            start: 0,
            reqlen: filesize,
            shard_urls: std::array::from_fn(|part| urls[part].take()),
            created_at: Utc::now(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Restrict the request to `len` bytes at `start`
    pub fn with_range(mut self, start: u64, len: u64) -> Result<Self> {
        self.start = start;
        self.reqlen = len;
        self.validate()?;
        Ok(self)
    }

    pub fn missing_sources(&self) -> usize {
        self.shard_urls.iter().filter(|url| url.is_none()).count()
    }

    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_sources();
        if missing > 1 {
            return Err(Error::TooManyMissingSources { missing });
        }

        let in_range = self
            .start
            .checked_add(self.reqlen)
            .is_some_and(|end| end <= self.filesize);
        if !in_range {
            return Err(Error::InvalidRange {
                start: self.start,
                len: self.reqlen,
                filesize: self.filesize,
            });
        }
        Ok(())
    }
}

/// Per-shard view in [`RequestStats`]
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub part: usize,
    pub state: FetchState,
    pub errors: u32,
    pub exhausted: bool,
    pub finished: bool,
    pub bytes_received: u64,
    pub readahead_chunks: usize,
}

/// Snapshot of a running request
#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    pub id: RequestId,
    pub created_at: DateTime<Utc>,
    pub remaining: u64,
    /// Approximate bytes of the range already in hand, see [`RaidRequest::progress`]
    pub progress: u64,
    pub completed_line: u64,
    pub mode: Mode,
    pub missing_source: bool,
    pub failure: Option<String>,
    pub shards: Vec<ShardStats>,
}

/// Everything a request borrows from the scheduler that runs it
pub(crate) struct RequestContext {
    pub(crate) id: RequestId,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) config: EngineConfig,
}

/// State of one retrieval
pub struct RaidRequest {
    pub(super) buffer: ReconstructionBuffer,
    pub(super) fetchers: [ShardFetcher; RAIDPARTS],
    pub(super) mode: Mode,
    /// Length of the requested range
    pub(super) reqlen: u64,
    /// Bytes still to deliver
    pub(super) remaining: u64,
    /// Shard offset past which no shard needs to be read
    pub(super) part_end: u64,
    pub(super) missing_source: bool,
    pub(super) feed_lag: [u64; RAIDPARTS],
    pub(super) lag_rounds: u32,
    pub(super) last_progress: Instant,
    pub(super) had_data: bool,
    pub(super) stall_reported: bool,
    pub(super) fatal: Option<Failure>,
    pub(super) readahead_reported: usize,
    pub(super) created_at: DateTime<Utc>,
    pub(super) ctx: RequestContext,
}

impl RaidRequest {
    pub(crate) fn new(params: &RequestParams, ctx: RequestContext) -> Result<Self> {
        params.validate()?;

        let config = &ctx.config;
        let filesize = params.filesize;
        let num_lines = buffer_lines(filesize, config.max_lines);
        let end_line = (params.start + params.reqlen).div_ceil(RAIDLINE as u64);
        let part_end = padded_part_size(filesize).min(end_line * RAIDSECTOR as u64);
        let now = Instant::now();

        let fetchers = std::array::from_fn(|part| {
            ShardFetcher::new(
                part,
                params.shard_urls[part].clone(),
                raid_part_size(part, filesize),
                ExponentialBackoff::new(
                    config.retry_delay(),
                    config.max_backoff(),
                    config.max_retries,
                ),
                now,
            )
        });

        let missing_source = params.missing_sources() > 0;
        info!(
            "request {}: {} bytes at offset {} of {}, {} lines buffered{}",
            ctx.id,
            params.reqlen,
            params.start,
            filesize,
            num_lines,
            if missing_source { ", one source missing" } else { "" }
        );
        ctx.metrics.request_started();

        Ok(RaidRequest {
            buffer: ReconstructionBuffer::new(num_lines, params.start),
            fetchers,
            mode: Mode::Fast,
            reqlen: params.reqlen,
            remaining: params.reqlen,
            part_end,
            missing_source,
            feed_lag: [0; RAIDPARTS],
            lag_rounds: 0,
            last_progress: now,
            had_data: false,
            stall_reported: false,
            fatal: None,
            readahead_reported: 0,
            created_at: params.created_at,
            ctx,
        })
    }

    pub fn id(&self) -> RequestId {
        self.ctx.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.fatal.as_ref()
    }

    /// Bytes of the range delivered, reconstructed or fetched so far.
    ///
    /// Shard bytes not yet part of a complete line count through the data
    /// shards only, so the figure lags slightly while parity stands in for
    /// a data shard. It never exceeds the requested length.
    pub fn progress(&self) -> u64 {
        let completed = (self.buffer.completed() * RAIDSECTOR) as u64;
        let pending: u64 = (RAIDPARTS - DATA_PARTS..RAIDPARTS)
            .map(|part| {
                let partial = (self.buffer.part_pos(part) as u64).saturating_sub(completed);
                partial
                    + self.buffer.readahead_bytes(part) as u64
                    + self.fetchers[part].body.len() as u64
            })
            .sum();

        let delivered = self.reqlen - self.remaining;
        (delivered + self.buffer.readable().len() as u64 + pending).min(self.reqlen)
    }

    /// Bytes ready to be consumed right now
    pub fn readable_len(&self) -> usize {
        self.buffer.readable().len()
    }

    /// Trigger every shard that has a source
    pub(crate) fn start(&mut self) {
        if self.remaining == 0 {
            return;
        }
        for part in 0..RAIDPARTS {
            self.trigger(part, None, false);
        }
    }

    /// Copy up to `buf.len()` reconstructed bytes into `buf`
    pub fn consume_into(&mut self, buf: &mut [u8], now: Instant) -> Result<usize> {
        let max_len = buf.len();
        self.consume_with(max_len, now, |bytes| {
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        })
    }

    /// Offer up to `max_len` reconstructed bytes to `sink`.
    ///
    /// `sink` returns how many bytes it took. Returns `Ok(0)` when nothing
    /// is ready or the range is complete, and the request's failure once
    /// it has failed.
    pub fn consume_with<F>(&mut self, max_len: usize, now: Instant, sink: F) -> Result<usize>
    where
        F: FnOnce(&[u8]) -> std::io::Result<usize>,
    {
        if let Some(failure) = &self.fatal {
            return Err(failure.clone().into());
        }
        if self.remaining == 0 {
            return Ok(0);
        }

        self.watchdog(now);
        self.process_readahead();

        let available = (self.buffer.readable().len() as u64)
            .min(max_len as u64)
            .min(self.remaining) as usize;

        if available > 0 {
            let taken = sink(&self.buffer.readable()[..available])?.min(available);
            if taken == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "sink accepted none of the reconstructed bytes",
                )
                .into());
            }
            self.advance(taken, now);
            return Ok(taken);
        }

        let idle = now.saturating_duration_since(self.last_progress);
        if idle >= self.ctx.config.feed_timeout() {
            let failure = Failure::FeedTimedOut {
                idle_secs: idle.as_secs(),
                had_data: self.had_data,
            };
            self.fail(failure.clone());
            return Err(failure.into());
        }

        if idle >= self.ctx.config.stall_report() && !self.stall_reported {
            self.stall_reported = true;
            warn!(
                "request {} stalled for {:?} at line {}",
                self.ctx.id,
                idle,
                self.buffer.completed_line()
            );
            for fetcher in &self.fetchers {
                debug!(
                    "request {} shard {}: {:?} at {} (+{}), {} errors",
                    self.ctx.id, fetcher.part, fetcher.state, fetcher.pos, fetcher.rem, fetcher.errors
                );
            }
        }

        Ok(0)
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            id: self.ctx.id,
            created_at: self.created_at,
            remaining: self.remaining,
            progress: self.progress(),
            completed_line: self.buffer.completed_line(),
            mode: self.mode,
            missing_source: self.missing_source,
            failure: self.fatal.as_ref().map(ToString::to_string),
            shards: self
                .fetchers
                .iter()
                .map(|f| ShardStats {
                    part: f.part,
                    state: f.state,
                    errors: f.errors,
                    exhausted: f.exhausted,
                    finished: f.finished,
                    bytes_received: f.bytes_received,
                    readahead_chunks: self.buffer.readahead_len(f.part),
                })
                .collect(),
        }
    }

    pub(super) fn task(&self, part: usize) -> Task {
        Task::new(self.ctx.id, part)
    }

    /// Completed lines and failure flag; a change means the reader should wake
    fn wake_state(&self) -> (u64, bool) {
        (self.buffer.completed_line(), self.fatal.is_some())
    }

    pub(super) fn sync_readahead_metric(&mut self) {
        let total = (0..RAIDPARTS).map(|p| self.buffer.readahead_len(p)).sum();
        if total != self.readahead_reported {
            self.ctx.metrics.readahead_changed(self.readahead_reported, total);
            self.readahead_reported = total;
        }
    }

    /// Record the first failure and stop every shard
    pub(super) fn fail(&mut self, failure: Failure) {
        if self.fatal.is_some() {
            return;
        }

        error!("request {} failed: {}", self.ctx.id, failure);
        self.ctx.transport.on_transfer_failure(&failure);
        self.ctx.metrics.transfer_failed();
        self.fatal = Some(failure);

        for part in 0..RAIDPARTS {
            self.close_socket(part);
        }
    }

    fn shut_down(&mut self) {
        for part in 0..RAIDPARTS {
            self.close_socket(part);
        }
        self.buffer.clear_readahead();
        self.sync_readahead_metric();
        if self.fatal.is_none() {
            self.fatal = Some(Failure::Removed);
        }
    }

    /// Hand `len` delivered bytes back to the buffer and refill the fetchers
    fn advance(&mut self, len: usize, now: Instant) {
        self.remaining -= len as u64;
        self.ctx.metrics.delivered(len);
        self.last_progress = now;
        self.had_data = true;
        self.stall_reported = false;

        if self.remaining == 0 {
            debug!("request {} delivered", self.ctx.id);
            return;
        }

        self.buffer.advance(len);

        let capacity = self.buffer.capacity() as u64;
        let mut pending = Vec::new();
        for part in 0..RAIDPARTS {
            self.feed_lag[part] += self.fetchers[part].rem_feed;
            let free = capacity - self.buffer.part_pos(part) as u64;
            if self.cont(part, free) {
                pending.push(part);
            }
        }

        self.lag_rounds += 1;
        if self.lag_rounds >= LAG_INTERVAL {
            self.evaluate_lag();
        }

        self.resume_all(None);

        for part in pending {
            self.step(part, now);
        }
    }

    /// Switch to slow mode when one shard trails all others by far
    fn evaluate_lag(&mut self) {
        let lag = std::mem::take(&mut self.feed_lag);
        self.lag_rounds = 0;

        let mut highest = 0;
        for part in 1..RAIDPARTS {
            if lag[part] > lag[highest] {
                highest = part;
            }
        }
        // parked and finished shards have no lag and are not compared
        let lowest = (0..RAIDPARTS)
            .filter(|&p| p != highest && lag[p] > 0)
            .map(|p| lag[p])
            .min()
            .unwrap_or(0);

        let threshold = self.buffer.capacity() as u64 * u64::from(LAG_INTERVAL) * 3 / 4;
        if self.missing_source
            || lag[highest] <= threshold
            || lag[highest] <= LAG_DOMINANCE * lowest
        {
            return;
        }

        if self.mode.is_slow(highest) {
            debug!("request {} shard {} already slow", self.ctx.id, highest);
            return;
        }

        let Some(companion) = self.lag_companion(highest, &lag) else {
            debug!("request {} shard {} lags but has no companion", self.ctx.id, highest);
            return;
        };

        info!(
            "request {} shard {} lags ({} unfed bytes), slowing it with shard {}",
            self.ctx.id, highest, lag[highest], companion
        );
        if self.mode == Mode::Fast {
            self.fetchers[highest].errors += 1;
        }
        self.ctx.metrics.lag_switch();
        self.ctx.transport.on_source_demoted(highest, Demotion::Lagging);
        self.to_slow_mode(highest, companion);
    }

    fn lag_companion(&self, lagging: usize, lag: &[u64; RAIDPARTS]) -> Option<usize> {
        if let Mode::Slow(previous, _) = self.mode {
            return Some(previous);
        }

        let idle = (0..RAIDPARTS).find(|&p| {
            p != lagging && self.fetchers[p].is_idle() && self.fetchers[p].errors < MAX_IDLE_ERRORS
        });
        if idle.is_some() {
            return idle;
        }

        (0..RAIDPARTS)
            .filter(|&p| p != lagging && self.fetchers[p].is_connected())
            .max_by_key(|&p| lag[p])
    }

    /// Replace a hanging shard, either with an idle one or by going slow
    fn watchdog(&mut self, now: Instant) {
        if self.missing_source || self.fatal.is_some() {
            return;
        }

        let threshold = self.ctx.config.hang_threshold();
        let hanging = (0..RAIDPARTS).find(|&p| {
            let f = &self.fetchers[p];
            f.state == FetchState::InFlight
                && f.rem_feed > 0
                && !self.mode.is_slow(p)
                && now.saturating_duration_since(f.last_activity()) > threshold
        });
        let Some(hanging) = hanging else {
            return;
        };

        if self.mode == Mode::Fast {
            let idle = (0..RAIDPARTS)
                .find(|&p| p != hanging && self.fetchers[p].is_idle() && self.fetchers[p].errors == 0);
            if let Some(idle) = idle {
                warn!(
                    "request {} shard {} hangs, switching to shard {}",
                    self.ctx.id, hanging, idle
                );
                self.ctx.metrics.watchdog_switch();
                self.ctx.transport.on_source_demoted(hanging, Demotion::Hanging);
                self.fetchers[hanging].errors += 1;
                self.close_socket(hanging);
                self.trigger(idle, None, false);
                return;
            }
        }

        let companion = (0..RAIDPARTS)
            .filter(|&p| p != hanging && self.fetchers[p].is_connected())
            .max_by_key(|&p| self.fetchers[p].rem_feed)
            .or_else(|| (0..RAIDPARTS).find(|&p| p != hanging && self.fetchers[p].is_usable()));

        match companion {
            Some(companion) => {
                warn!(
                    "request {} shard {} hangs, slowing it with shard {}",
                    self.ctx.id, hanging, companion
                );
                self.ctx.metrics.watchdog_switch();
                self.ctx.transport.on_source_demoted(hanging, Demotion::Hanging);
                self.to_slow_mode(hanging, companion);
            }
            None => debug!("request {} shard {} hangs with no companion", self.ctx.id, hanging),
        }
    }

    /// Make `a` and `b` the slow pair
    pub(super) fn to_slow_mode(&mut self, a: usize, b: usize) {
        let previous = self.mode;
        self.mode = Mode::Slow(a, b);
        if previous == Mode::Fast {
            self.ctx.metrics.mode_changed(true);
        }
        info!("request {} slow mode on shards {} and {}", self.ctx.id, a, b);

        for old in previous.slow_parts().into_iter().flatten() {
            if old != a && old != b {
                self.trigger(old, None, false);
            }
        }
        for part in [a, b] {
            if !previous.is_slow(part) {
                self.trigger(part, None, false);
            }
        }
    }

    pub(super) fn to_fast_mode(&mut self) {
        let Some([a, b]) = self.mode.slow_parts() else {
            return;
        };

        self.mode = Mode::Fast;
        self.ctx.metrics.mode_changed(false);
        info!("request {} back to fast mode", self.ctx.id);

        self.trigger(a, None, false);
        self.trigger(b, None, false);
    }
}

impl Drop for RaidRequest {
    fn drop(&mut self) {
        for part in 0..RAIDPARTS {
            if let Some(conn) = self.fetchers[part].conn.take() {
                self.ctx.transport.disconnect(conn);
            }
        }
        self.ctx.metrics.readahead_changed(self.readahead_reported, 0);
        self.ctx.metrics.request_finished(self.mode != Mode::Fast);
    }
}

/// A request shared between its scheduler and its reader
pub(crate) struct SharedRequest {
    id: RequestId,
    state: Mutex<RaidRequest>,
    data_ready: Condvar,
}

impl SharedRequest {
    pub(crate) fn new(request: RaidRequest) -> Self {
        SharedRequest {
            id: request.id(),
            state: Mutex::new(request),
            data_ready: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn start(&self) {
        self.state.lock().start();
    }

    /// Step shard `part` unless the reader holds the request
    pub(crate) fn try_dispatch(&self, part: usize) -> bool {
        match self.state.try_lock() {
            Some(mut request) => {
                self.step_locked(&mut request, part);
                true
            }
            None => false,
        }
    }

    pub(crate) fn dispatch(&self, part: usize) {
        let mut request = self.state.lock();
        self.step_locked(&mut request, part);
    }

    fn step_locked(&self, request: &mut RaidRequest, part: usize) {
        let before = request.wake_state();
        request.step(part, Instant::now());
        if request.wake_state() != before {
            self.data_ready.notify_all();
        }
    }

    pub(crate) fn consume(&self, buf: &mut [u8]) -> Result<usize> {
        self.state.lock().consume_into(buf, Instant::now())
    }

    /// Run `op` until it delivers, the range ends or the request fails.
    ///
    /// Between attempts the caller sleeps on the condvar for at most
    /// `interval` so timeouts are noticed without new data.
    pub(crate) fn wait_for<F>(&self, interval: Duration, mut op: F) -> Result<usize>
    where
        F: FnMut(&mut RaidRequest, Instant) -> Result<usize>,
    {
        let mut request = self.state.lock();
        loop {
            let n = op(&mut request, Instant::now())?;
            if n > 0 || request.remaining() == 0 || request.readable_len() > 0 {
                return Ok(n);
            }
            self.data_ready.wait_for(&mut request, interval);
        }
    }

    pub(crate) fn stats(&self) -> RequestStats {
        self.state.lock().stats()
    }

    /// Disconnect every shard; later reads report the request as removed
    pub(crate) fn shut_down(&self) {
        self.state.lock().shut_down();
        self.data_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raid::fetcher::FAST_WINDOW_SPAN;
    use crate::transport::{Demotion, Fault, MemoryTransport};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 241) as u8).collect()
    }

    struct Harness {
        queue: Arc<WorkQueue>,
        transport: MemoryTransport,
        metrics: Arc<EngineMetrics>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                queue: WorkQueue::new(),
                transport: MemoryTransport::new(),
                metrics: Arc::new(EngineMetrics::new()),
            }
        }

        fn request(&self, params: &RequestParams, config: EngineConfig) -> RaidRequest {
            let ctx = RequestContext {
                id: RequestId::new(1),
                queue: self.queue.clone(),
                transport: Arc::new(self.transport.clone()),
                metrics: self.metrics.clone(),
                config,
            };
            RaidRequest::new(params, ctx).unwrap()
        }

        /// Step every task that is due until the queue runs dry
        fn pump(&self, request: &mut RaidRequest) {
            for _ in 0..10_000 {
                let tasks = self.queue.drain_due(Instant::now());
                if tasks.is_empty() {
                    return;
                }
                for task in tasks {
                    request.step(task.part, Instant::now());
                }
            }
        }

        fn read_all(&self, request: &mut RaidRequest) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = vec![0u8; 333];
            for _ in 0..100_000 {
                let n = request.consume_into(&mut buf, Instant::now()).unwrap();
                if n == 0 {
                    if request.remaining() == 0 {
                        break;
                    }
                    self.pump(request);
                    continue;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            max_lines: 8,
            retry_delay_ms: 0,
            max_backoff_ms: 0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_params_validation() {
        let urls = (0..RAIDPARTS).map(|p| format!("mem://x/part{}", p));
        let params = RequestParams::new(1_000, urls).unwrap();
        assert_eq!((params.start, params.reqlen), (0, 1_000));
        assert_eq!(params.missing_sources(), 0);

        assert!(matches!(
            params.clone().with_range(900, 200),
            Err(Error::InvalidRange { start: 900, len: 200, filesize: 1_000 })
        ));
        assert!(params.with_range(900, 100).is_ok());

        assert!(matches!(
            RequestParams::new(10, ["a", "b", "c"]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RequestParams::new(10, ["a", "", "c", "d", "", "f"]),
            Err(Error::TooManyMissingSources { missing: 2 })
        ));
    }

    #[test]
    fn test_mode_helpers() {
        assert!(!Mode::Fast.is_slow(0));
        assert!(Mode::Slow(2, 4).is_slow(4));
        assert!(!Mode::Slow(2, 4).is_slow(3));
        assert_eq!(Mode::Slow(2, 4).slow_parts(), Some([2, 4]));
    }

    #[test]
    fn test_fast_mode_parks_sixth_source() {
        let harness = Harness::new();
        let data = sample(5_000);
        let urls = harness.transport.publish("park", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, EngineConfig::default());

        request.start();
        harness.pump(&mut request);

        let connected = request.fetchers.iter().filter(|f| f.is_connected()).count();
        let finished = request.fetchers.iter().filter(|f| f.finished).count();
        assert_eq!(connected + finished, DATA_PARTS);
        assert_eq!(request.fetchers[5].state, FetchState::Disconnected);
        assert_eq!(request.fetchers[5].bytes_received, 0);

        assert_eq!(harness.read_all(&mut request), data);
    }

    #[test]
    fn test_small_buffer_streams_whole_file() {
        let harness = Harness::new();
        let data = sample(20_011);
        let urls = harness.transport.publish("stream", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        assert_eq!(harness.read_all(&mut request), data);
        assert_eq!(harness.metrics.snapshot().bytes_delivered, data.len() as u64);
    }

    #[test]
    fn test_partial_range() {
        let harness = Harness::new();
        let data = sample(9_000);
        let urls = harness.transport.publish("range", &data);
        let params = RequestParams::new(data.len() as u64, urls)
            .unwrap()
            .with_range(1_234, 4_321)
            .unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        assert_eq!(harness.read_all(&mut request), &data[1_234..1_234 + 4_321]);
    }

    #[test]
    fn test_missing_source_is_rebuilt() {
        let harness = Harness::new();
        let data = sample(7_777);
        let mut urls = harness.transport.publish("lost", &data);
        urls[3].clear();
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        assert_eq!(harness.read_all(&mut request), data);
        assert!(request.stats().missing_source);
        assert_eq!(request.stats().shards[3].bytes_received, 0);
    }

    #[test]
    fn test_failing_source_is_replaced() {
        let harness = Harness::new();
        let data = sample(6_400);
        let urls = harness.transport.publish("replace", &data);
        harness.transport.set_fault(2, Fault::Fail);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        assert_eq!(harness.read_all(&mut request), data);

        let stats = request.stats();
        assert!(stats.shards[2].errors > 0);
        assert!(stats.shards[5].bytes_received > 0);
    }

    #[test]
    fn test_permanent_failure_ends_request() {
        let harness = Harness::new();
        let data = sample(3_000);
        let urls = harness.transport.publish("permanent", &data);
        harness.transport.set_fault(1, Fault::Permanent);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        harness.pump(&mut request);

        let mut buf = [0u8; 64];
        let err = request.consume_into(&mut buf, Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::Request(Failure::PermanentTransport { part: 1, .. })
        ));
        assert_eq!(harness.transport.transfer_failures(), 1);
        assert_eq!(harness.metrics.snapshot().failed_transfers, 1);
    }

    #[test]
    fn test_feed_timeout() {
        let harness = Harness::new();
        let data = sample(2_000);
        let urls = harness.transport.publish("timeout", &data);
        for part in 0..RAIDPARTS {
            harness.transport.set_fault(part, Fault::Hang);
        }
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let config = EngineConfig {
            feed_timeout_ms: 100,
            ..small_config()
        };
        let mut request = harness.request(&params, config);

        request.start();
        harness.pump(&mut request);

        let mut buf = [0u8; 64];
        let now = Instant::now();
        assert_eq!(request.consume_into(&mut buf, now).unwrap(), 0);

        let later = now + Duration::from_millis(500);
        let err = request.consume_into(&mut buf, later).unwrap_err();
        assert!(matches!(
            err,
            Error::Request(Failure::FeedTimedOut { had_data: false, .. })
        ));
        // sticky
        assert!(request.consume_into(&mut buf, later).is_err());
    }

    #[test]
    fn test_slow_mode_round_trip() {
        let harness = Harness::new();
        let data = sample(40_000);
        let urls = harness.transport.publish("modes", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());
        let horizon = request.buffer.capacity() as u64;

        request.start();
        harness.pump(&mut request);

        let mut out = vec![0u8; 1_000];
        let n = request.consume_into(&mut out, Instant::now()).unwrap();
        out.truncate(n);

        request.to_slow_mode(1, 2);
        assert_eq!(request.mode(), Mode::Slow(1, 2));
        assert_eq!(harness.metrics.snapshot().slow_requests, 1);
        harness.pump(&mut request);

        for part in [1, 2] {
            assert!(request.fetchers[part].rem <= horizon);
        }

        let mut buf = vec![0u8; 777];
        let n = request.consume_into(&mut buf, Instant::now()).unwrap();
        out.extend_from_slice(&buf[..n]);

        request.to_fast_mode();
        assert_eq!(request.mode(), Mode::Fast);
        assert_eq!(harness.metrics.snapshot().fast_requests, 1);

        out.extend(harness.read_all(&mut request));
        assert_eq!(out, data);
    }

    #[test]
    fn test_lagging_shard_goes_slow() {
        let harness = Harness::new();
        let data = sample(30_000);
        let urls = harness.transport.publish("lag", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        harness.pump(&mut request);
        assert!(request.fetchers[5].is_idle());

        let capacity = request.buffer.capacity() as u64;
        request.feed_lag = [1, 1, capacity * u64::from(LAG_INTERVAL), 1, 1, 0];
        request.evaluate_lag();

        assert_eq!(request.mode(), Mode::Slow(2, 5));
        assert_eq!(request.fetchers[2].errors, 1);
        assert_eq!(request.feed_lag, [0; RAIDPARTS]);
        assert_eq!(harness.metrics.snapshot().lag_switches, 1);
        assert_eq!(harness.transport.demotions(), vec![(2, Demotion::Lagging)]);

        // a lag below the threshold changes nothing
        request.feed_lag = [0, 0, 0, capacity, 0, 0];
        request.evaluate_lag();
        assert_eq!(request.mode(), Mode::Slow(2, 5));

        assert_eq!(harness.read_all(&mut request), data);
    }

    #[test]
    fn test_lag_ignores_shards_without_feed() {
        let harness = Harness::new();
        let data = sample(30_000);
        let urls = harness.transport.publish("lag-idle", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());

        request.start();
        harness.pump(&mut request);

        // shard 5 is parked and shard 4 nearly kept up
        let lagging = request.buffer.capacity() as u64 * u64::from(LAG_INTERVAL);
        request.feed_lag = [0, 0, lagging, 0, lagging / 8, 0];
        request.evaluate_lag();

        assert_eq!(request.mode(), Mode::Fast);
        assert_eq!(harness.metrics.snapshot().lag_switches, 0);
        assert!(harness.transport.demotions().is_empty());
    }

    #[test]
    fn test_hanging_shard_without_substitute_goes_slow() {
        let harness = Harness::new();
        let data = sample(30_000);
        let urls = harness.transport.publish("hang-slow", &data);
        harness.transport.set_fault(2, Fault::Hang);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let config = small_config();
        let threshold = config.hang_threshold();
        let mut request = harness.request(&params, config);

        request.start();
        harness.pump(&mut request);
        assert_eq!(request.fetchers[2].state, FetchState::InFlight);
        assert!(request.fetchers[5].is_idle());
        assert_eq!(request.readable_len(), 0);

        // the parked shard failed before, so it does not qualify as a substitute
        request.fetchers[5].errors = 1;
        request.watchdog(Instant::now() + threshold + Duration::from_secs(1));

        let companion = match request.mode() {
            Mode::Slow(2, companion) => companion,
            other => panic!("expected shard 2 to go slow, got {:?}", other),
        };
        assert!([0, 1, 3, 4].contains(&companion));
        assert_eq!(request.fetchers[2].errors, 0);
        assert_eq!(harness.metrics.snapshot().watchdog_switches, 1);
        assert_eq!(harness.transport.demotions(), vec![(2, Demotion::Hanging)]);

        // the restarted source answers again
        harness.transport.clear_fault(2);
        assert_eq!(harness.read_all(&mut request), data);
    }

    #[test]
    fn test_stall_is_reported_before_timeout() {
        let harness = Harness::new();
        let data = sample(2_000);
        let urls = harness.transport.publish("stall", &data);
        for part in 0..RAIDPARTS {
            harness.transport.set_fault(part, Fault::Hang);
        }
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let config = EngineConfig {
            stall_report_ms: 500,
            feed_timeout_ms: 5_000,
            ..small_config()
        };
        let mut request = harness.request(&params, config);

        request.start();
        harness.pump(&mut request);

        let mut buf = [0u8; 64];
        let now = Instant::now();
        assert_eq!(request.consume_into(&mut buf, now).unwrap(), 0);
        assert!(!request.stall_reported);

        let stalled = now + Duration::from_millis(700);
        assert_eq!(request.consume_into(&mut buf, stalled).unwrap(), 0);
        assert!(request.stall_reported);
        assert!(request.failure().is_none());

        let later = now + Duration::from_millis(800);
        assert_eq!(request.consume_into(&mut buf, later).unwrap(), 0);
        assert!(request.stall_reported);

        let timed_out = now + Duration::from_secs(10);
        assert!(request.consume_into(&mut buf, timed_out).is_err());
    }

    #[test]
    fn test_fast_windows_hold_bounded_bodies() {
        let harness = Harness::new();
        let data = sample(200_000);
        let urls = harness.transport.publish("bounded", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());
        let bound = FAST_WINDOW_SPAN * request.buffer.capacity() as u64;

        request.start();
        harness.pump(&mut request);

        for fetcher in &request.fetchers {
            assert!(fetcher.rem <= bound, "shard {} window {}", fetcher.part, fetcher.rem);
            assert!(fetcher.body.len() as u64 <= bound);
            assert!(fetcher.bytes_received <= bound);
        }

        let readable = request.readable_len() as u64;
        assert!(readable > 0);
        assert!(request.progress() > readable);
        assert!(request.progress() <= data.len() as u64);

        assert_eq!(harness.read_all(&mut request), data);
        assert_eq!(request.progress(), data.len() as u64);
        assert_eq!(request.stats().progress, data.len() as u64);
        assert!(harness.transport.latency_samples() >= DATA_PARTS);
    }

    #[test]
    fn test_drop_releases_metrics() {
        let harness = Harness::new();
        let data = sample(1_000);
        let urls = harness.transport.publish("drop", &data);
        let params = RequestParams::new(data.len() as u64, urls).unwrap();
        let mut request = harness.request(&params, small_config());
        request.start();
        harness.pump(&mut request);
        request.to_slow_mode(0, 3);

        drop(request);
        let s = harness.metrics.snapshot();
        assert_eq!((s.fast_requests, s.slow_requests, s.readahead_chunks), (0, 0, 0));
    }
}
