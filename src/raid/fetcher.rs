//! Shard fetchers
//!
//! Each request owns one fetcher per shard. A fetcher moves through
//! `Disconnected → Connecting → Prepared → InFlight → Success | Failure`,
//! asking its transport connection for one window of the shard at a
//! time and feeding the response into the reconstruction buffer.

use super::buffer::ReconstructionBuffer;
use super::request::{Mode, RaidRequest};
use super::{sector_floor, DATA_PARTS, RAIDPARTS};
use crate::error::Failure;
use crate::transport::{
    Connection, Demotion, ExponentialBackoff, RequestFailure, ShardWaker, TransferStatus,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Buffer capacities a fast-mode window may span
pub(super) const FAST_WINDOW_SPAN: u64 = 2;

/// Connection state of a shard fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchState {
    /// No connection and nothing scheduled
    Disconnected,
    /// Waiting to open a request, possibly after a backoff
    Connecting,
    /// Range request prepared but not yet posted
    Prepared,
    /// Waiting for the response
    InFlight,
    /// Holding a response that is being fed to the buffer
    Success,
    /// The last request failed
    Failure,
}

impl FetchState {
    /// True while a request is open or a response is still being fed
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            FetchState::Prepared | FetchState::InFlight | FetchState::Success
        )
    }
}

/// Fetch cursor and connection of one shard
pub(super) struct ShardFetcher {
    pub(super) part: usize,
    pub(super) url: Option<String>,
    pub(super) source_size: u64,
    /// Shard offset of the next byte to feed
    pub(super) pos: u64,
    /// Bytes left in the current window
    pub(super) rem: u64,
    /// Bytes the buffer currently accepts from this window
    pub(super) rem_feed: u64,
    pub(super) state: FetchState,
    pub(super) conn: Option<Box<dyn Connection>>,
    pub(super) body: Bytes,
    pub(super) errors: u32,
    pub(super) backoff: ExponentialBackoff,
    pub(super) exhausted: bool,
    pub(super) finished: bool,
    pub(super) delay_until: Option<Instant>,
    pub(super) last_data: Instant,
    /// When the current request was posted
    pub(super) posted_at: Option<Instant>,
    pub(super) bytes_received: u64,
}

impl ShardFetcher {
    pub(super) fn new(
        part: usize,
        url: Option<String>,
        source_size: u64,
        backoff: ExponentialBackoff,
        now: Instant,
    ) -> Self {
        ShardFetcher {
            part,
            url,
            source_size,
            pos: 0,
            rem: 0,
            rem_feed: 0,
            state: FetchState::Disconnected,
            conn: None,
            body: Bytes::new(),
            errors: 0,
            backoff,
            exhausted: false,
            finished: false,
            delay_until: None,
            last_data: now,
            posted_at: None,
            bytes_received: 0,
        }
    }

    /// Has a source and has not run out of retries
    pub(super) fn is_usable(&self) -> bool {
        self.url.is_some() && !self.exhausted
    }

    pub(super) fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Parked with work left, available to take over for another shard
    pub(super) fn is_idle(&self) -> bool {
        self.state == FetchState::Disconnected && self.is_usable() && !self.finished
    }

    pub(super) fn set_rem_feed(&mut self, limit: u64) {
        self.rem_feed = self
            .rem
            .min(limit)
            .min(self.source_size.saturating_sub(self.pos));
    }

    pub(super) fn last_activity(&self) -> Instant {
        let wire = self.conn.as_ref().and_then(|c| c.last_activity());
        match wire {
            Some(at) if at > self.last_data => at,
            _ => self.last_data,
        }
    }

    /// Response length expected for the current window
    fn expected_body(&self) -> u64 {
        (self.pos + self.rem)
            .min(self.source_size)
            .saturating_sub(self.pos)
    }
}

/// A shard range to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Window {
    pub pos: u64,
    pub rem: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Coverage {
    valid: i32,
    own: i32,
}

/// Work out which range of its shard `part` should fetch next.
///
/// Coverage is counted per sector from the bytes already buffered,
/// the windows other shards have in flight and every shard's readahead.
/// The window starts at the first sector known by fewer than five
/// shards and ends where five are known again or where this shard's own
/// readahead begins. With a `horizon` the window is capped, and None is
/// returned once the shard has run more than three horizons ahead.
pub(super) fn next_window(
    buffer: &ReconstructionBuffer,
    fetchers: &[ShardFetcher],
    part: usize,
    horizon: Option<u64>,
    part_end: u64,
) -> Option<Window> {
    let mut edges: BTreeMap<u64, Coverage> = BTreeMap::new();
    let mut mark = |at: u64, valid: i32, own: i32| {
        let edge = edges.entry(sector_floor(at)).or_default();
        edge.valid += valid;
        edge.own += own;
    };

    for (i, fetcher) in fetchers.iter().enumerate() {
        mark(buffer.part_cursor(i), -1, 0);

        if i != part && fetcher.rem > 0 {
            mark(fetcher.pos, 1, 0);
            mark(fetcher.pos + fetcher.rem, -1, 0);
        }

        let own = i32::from(i == part);
        for (start, end) in buffer.readahead_runs(i) {
            mark(start, 1, own);
            mark(end, -1, -own);
        }
    }

    let base = buffer.base_pos();
    let cursor = buffer.part_cursor(part);
    let needed = DATA_PARTS as i32;
    let mut valid = RAIDPARTS as i32;
    let mut own = 0;
    let mut start = None;
    let mut end = None;

    let mut iter = edges.iter().peekable();
    while let Some((&at, edge)) = iter.next() {
        valid += edge.valid;
        own += edge.own;

        match start {
            None => {
                if own == 0 && valid < needed {
                    if cursor < at {
                        start = Some(at);
                    } else if iter.peek().map_or(true, |&(&next, _)| cursor < next) {
                        start = Some(cursor);
                    }
                }
            }
            Some(from) => {
                if horizon.is_some_and(|h| at.saturating_sub(from) > h) {
                    break;
                }
                if own > 0 || valid >= needed {
                    end = Some(at);
                    break;
                }
            }
        }
    }

    let start = sector_floor(start.unwrap_or(cursor)).min(part_end);
    let rem = match end {
        Some(end) => end.min(part_end).saturating_sub(start),
        None => {
            let rem = part_end.saturating_sub(start);
            match horizon {
                Some(h) if rem > h => {
                    if start.saturating_sub(base) > 3 * h {
                        return None;
                    }
                    h
                }
                _ => rem,
            }
        }
    };

    Some(Window { pos: start, rem })
}

impl RaidRequest {
    /// Advance the state machine of shard `part`
    pub(crate) fn step(&mut self, part: usize, now: Instant) {
        if self.fatal.is_some() {
            return;
        }

        let before = self.buffer.completed_line();

        match self.fetchers[part].state {
            FetchState::Disconnected => {}
            FetchState::Connecting => self.step_connecting(part, now),
            FetchState::Prepared => self.step_post(part, now),
            FetchState::InFlight => self.step_poll(part, now),
            FetchState::Success => self.step_feed(part, now),
            FetchState::Failure => self.handle_failure(part, "request failed"),
        }

        if self.buffer.completed_line() > before {
            self.last_progress = now;
        }
        self.sync_readahead_metric();
    }

    /// Restart shard `part`, optionally after `delay`.
    ///
    /// Any open request is abandoned. Unless `keep_window` is set the
    /// window is recomputed when the fetcher next connects.
    pub(super) fn trigger(&mut self, part: usize, delay: Option<Duration>, keep_window: bool) {
        let task = self.task(part);
        let fetcher = &mut self.fetchers[part];
        if !fetcher.is_usable() || fetcher.finished {
            return;
        }

        if matches!(fetcher.state, FetchState::Prepared | FetchState::InFlight) {
            if let Some(conn) = fetcher.conn.take() {
                self.ctx.transport.disconnect(conn);
            }
        }

        if !keep_window {
            fetcher.rem = 0;
            fetcher.rem_feed = 0;
            fetcher.body = Bytes::new();
        }
        fetcher.state = FetchState::Connecting;

        match delay {
            Some(delay) => {
                let at = Instant::now() + delay;
                fetcher.delay_until = Some(at);
                self.ctx.queue.schedule(at, task);
            }
            None => {
                fetcher.delay_until = None;
                self.ctx.queue.push(task);
            }
        }
    }

    /// Drop the connection of shard `part` and forget its window
    pub(super) fn close_socket(&mut self, part: usize) {
        let fetcher = &mut self.fetchers[part];
        if let Some(conn) = fetcher.conn.take() {
            self.ctx.transport.disconnect(conn);
        }

        fetcher.state = FetchState::Disconnected;
        fetcher.rem = 0;
        fetcher.rem_feed = 0;
        fetcher.body = Bytes::new();
        fetcher.delay_until = None;
        fetcher.posted_at = None;
    }

    /// Grant a connected fetcher `free` bytes of buffer space.
    ///
    /// Returns true when it holds response bytes it can feed right away.
    pub(super) fn cont(&mut self, part: usize, free: u64) -> bool {
        let part_end = self.part_end;
        let fetcher = &mut self.fetchers[part];
        if !fetcher.is_connected() || fetcher.pos >= part_end {
            return false;
        }

        fetcher.set_rem_feed(free);
        fetcher.state == FetchState::Success && fetcher.rem_feed > 0
    }

    /// Restart a parked fetcher if there is a gap it should fill
    pub(super) fn resume(&mut self, part: usize) {
        let fetcher = &self.fetchers[part];
        if fetcher.state != FetchState::Disconnected || !fetcher.is_usable() || fetcher.finished {
            return;
        }

        if let Some(window) = self.window_for(part) {
            if window.rem > 0 {
                self.apply_window(part, window);
                self.trigger(part, None, true);
            }
        }
    }

    /// In slow mode every parked fetcher is given a chance to resume
    pub(super) fn resume_all(&mut self, except: Option<usize>) {
        if self.mode == Mode::Fast {
            return;
        }

        for part in (0..RAIDPARTS).filter(|&p| Some(p) != except) {
            self.resume(part);
        }
    }

    /// Merge readahead of every shard until nothing more fits
    pub(super) fn process_readahead(&mut self) {
        loop {
            let mut fed = false;
            for part in 0..RAIDPARTS {
                fed |= self.buffer.feed_readahead(part);
            }
            if !fed {
                break;
            }
        }
    }

    /// Next window of `part`, bounded so a response never holds more
    /// than a few buffer capacities of unfed bytes
    pub(super) fn window_for(&self, part: usize) -> Option<Window> {
        let capacity = self.buffer.capacity() as u64;
        if self.mode.is_slow(part) {
            return next_window(&self.buffer, &self.fetchers, part, Some(capacity), self.part_end);
        }

        next_window(&self.buffer, &self.fetchers, part, None, self.part_end).map(|window| Window {
            rem: window.rem.min(FAST_WINDOW_SPAN * capacity),
            ..window
        })
    }

    fn apply_window(&mut self, part: usize, window: Window) {
        let capacity = self.buffer.capacity() as u64;
        let fetcher = &mut self.fetchers[part];
        fetcher.pos = window.pos;
        fetcher.rem = window.rem;
        fetcher.set_rem_feed(capacity);
        trace!(
            "request {} shard {} window [{}, {})",
            self.ctx.id,
            part,
            window.pos,
            window.pos + window.rem
        );
    }

    fn connected_except(&self, part: usize) -> usize {
        self.fetchers
            .iter()
            .filter(|f| f.part != part && f.is_connected())
            .count()
    }

    fn step_connecting(&mut self, part: usize, now: Instant) {
        let fetcher = &mut self.fetchers[part];
        if !fetcher.is_usable() || fetcher.finished {
            self.close_socket(part);
            return;
        }

        if let Some(until) = fetcher.delay_until {
            if now < until {
                self.ctx.queue.schedule(until, self.task(part));
                return;
            }
            fetcher.delay_until = None;
        }

        if self.mode == Mode::Fast && self.connected_except(part) >= DATA_PARTS {
            debug!(
                "request {} shard {}: {} sources already connected",
                self.ctx.id, part, DATA_PARTS
            );
            self.close_socket(part);
            return;
        }

        if self.fetchers[part].rem == 0 {
            if let Some(window) = self.window_for(part) {
                self.apply_window(part, window);
            }
        }

        if self.fetchers[part].rem == 0 {
            self.close_socket(part);
            self.resume_all(Some(part));
            return;
        }

        let fetcher = &mut self.fetchers[part];
        if fetcher.pos >= fetcher.source_size {
            // only zero padding is left
            fetcher.state = FetchState::Success;
            self.step_feed(part, now);
            return;
        }

        let Some(url) = fetcher.url.clone() else {
            return;
        };
        let range = fetcher.pos..(fetcher.pos + fetcher.rem).min(fetcher.source_size);
        let transport = &self.ctx.transport;
        let conn = fetcher.conn.get_or_insert_with(|| transport.connect(part));

        conn.prepare(&url, range);
        fetcher.state = FetchState::Prepared;
        self.ctx.metrics.connection_opened();

        self.step_post(part, now);
    }

    fn step_post(&mut self, part: usize, now: Instant) {
        let waker = ShardWaker::new(&self.ctx.queue, self.task(part));
        let fetcher = &mut self.fetchers[part];

        let posted = match fetcher.conn.as_mut() {
            Some(conn) => conn.post(waker),
            None => false,
        };

        if posted {
            fetcher.state = FetchState::InFlight;
            fetcher.last_data = now;
            fetcher.posted_at = Some(now);
            self.step_poll(part, now);
        } else {
            fetcher.state = FetchState::Failure;
            self.handle_failure(part, "request could not be posted");
        }
    }

    fn step_poll(&mut self, part: usize, now: Instant) {
        let fetcher = &mut self.fetchers[part];
        let Some(conn) = fetcher.conn.as_mut() else {
            self.close_socket(part);
            return;
        };

        match conn.poll() {
            TransferStatus::InFlight => {}
            TransferStatus::Complete(mut body) => {
                let expected = fetcher.expected_body() as usize;
                if body.is_empty() && expected > 0 {
                    fetcher.state = FetchState::Failure;
                    self.handle_failure(part, "empty response");
                    return;
                }
                body.truncate(expected);

                if let Some(posted) = fetcher.posted_at.take() {
                    let latency = now.saturating_duration_since(posted);
                    self.ctx.transport.on_request_latency(part, latency);
                }
                fetcher.bytes_received += body.len() as u64;
                self.ctx.metrics.received(body.len());
                fetcher.body = body;
                fetcher.state = FetchState::Success;
                fetcher.last_data = now;
                self.step_feed(part, now);
            }
            TransferStatus::Failed(reason) => {
                fetcher.state = FetchState::Failure;
                self.handle_failure(part, &reason);
            }
        }
    }

    fn step_feed(&mut self, part: usize, now: Instant) {
        loop {
            let fetcher = &mut self.fetchers[part];
            if fetcher.rem_feed == 0 || fetcher.body.is_empty() {
                break;
            }

            let n = fetcher.rem_feed.min(fetcher.body.len() as u64);
            let chunk = fetcher.body.split_to(n as usize);
            let pos = fetcher.pos;
            fetcher.pos += n;
            fetcher.rem -= n;
            fetcher.rem_feed -= n;
            fetcher.last_data = now;
            if fetcher.rem == 0 {
                fetcher.backoff.reset();
            }

            self.buffer.absorb(part, chunk, pos);
        }

        let part_end = self.part_end;
        let fetcher = &mut self.fetchers[part];
        if fetcher.rem_feed == 0
            && fetcher.body.is_empty()
            && fetcher.pos >= fetcher.source_size
            && fetcher.pos < part_end
        {
            let pos = fetcher.pos;
            fetcher.pos = part_end;
            fetcher.rem = 0;
            fetcher.backoff.reset();
            let padding = Bytes::from(vec![0u8; (part_end - pos) as usize]);
            self.buffer.absorb(part, padding, pos);
        }

        self.process_readahead();

        let fetcher = &self.fetchers[part];
        if fetcher.rem == 0 {
            if fetcher.pos >= part_end && self.buffer.readahead_is_empty(part) {
                debug!("request {} shard {} finished", self.ctx.id, part);
                self.fetchers[part].finished = true;
                self.close_socket(part);
                self.resume_all(Some(part));
            } else {
                self.trigger(part, None, false);
            }
        } else if fetcher.body.is_empty() {
            // short response, ask for the rest of the window
            self.trigger(part, None, true);
        }
    }

    fn handle_failure(&mut self, part: usize, reason: &str) {
        self.ctx.metrics.request_failed();

        let fetcher = &mut self.fetchers[part];
        let verdict = match fetcher.conn.as_mut() {
            Some(conn) => self.ctx.transport.on_request_failure(conn.as_mut(), part),
            None => RequestFailure::Unhandled,
        };

        if let RequestFailure::Permanent(reason) = &verdict {
            let reason = reason.clone();
            self.fail(Failure::PermanentTransport { part, reason });
            return;
        }

        fetcher.errors += 1;
        let backoff = fetcher.backoff.next_delay();
        let attempts = fetcher.backoff.attempts();
        self.close_socket(part);

        if backoff.is_none() {
            self.fetchers[part].exhausted = true;
            self.ctx.metrics.source_exhausted();
            self.ctx.transport.on_source_demoted(part, Demotion::Exhausted);
            warn!(
                "request {} shard {} given up after {} consecutive errors: {}",
                self.ctx.id, part, attempts, reason
            );

            if self.mode != Mode::Fast {
                self.to_fast_mode();
            }

            let usable = self.fetchers.iter().filter(|f| f.is_usable()).count();
            if usable < DATA_PARTS {
                self.fail(Failure::SourcesExhausted {
                    usable,
                    required: DATA_PARTS,
                });
                return;
            }
        }

        // idle sources may be able to cover the gap
        for other in 0..RAIDPARTS {
            if other != part && self.fetchers[other].is_idle() {
                self.trigger(other, None, false);
            }
        }

        if let Some(backoff) = backoff {
            let delay = match verdict {
                RequestFailure::Retry(delay) => delay,
                _ => backoff,
            };
            debug!(
                "request {} shard {} failed ({}), attempt {} retrying in {:?}",
                self.ctx.id, part, reason, attempts, delay
            );
            self.trigger(part, Some(delay), false);
        }
    }
}
