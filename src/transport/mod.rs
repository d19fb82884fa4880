//! Transport boundary
//!
//! The engine never talks to the network itself. A [`Transport`] hands
//! out [`Connection`]s, one per shard fetcher, that perform ranged reads
//! of a shard URL and report completion through a [`ShardWaker`].

pub mod backoff;
pub mod file;
pub mod memory;

pub use backoff::ExponentialBackoff;
pub use file::FileTransport;
pub use memory::{Fault, MemoryTransport};

use crate::error::Failure;
use crate::scheduler::{Task, WorkQueue};
use bytes::Bytes;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Outcome of polling a posted request
#[derive(Debug)]
pub enum TransferStatus {
    /// Still waiting for the response
    InFlight,
    /// The full response body for the prepared range
    Complete(Bytes),
    /// The request failed
    Failed(String),
}

/// How the transport wants a failed request to be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// Use the engine's own backoff
    Unhandled,
    /// Retry after the given delay
    Retry(Duration),
    /// Non-retryable; the whole request fails
    Permanent(String),
}

/// Why a shard source was taken out of the fast set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Demotion {
    /// No data arrived for longer than the hang threshold
    Hanging,
    /// Its feed trailed the other shards by far
    Lagging,
    /// It ran out of retries
    Exhausted,
}

/// Factory and policy side of a transport
pub trait Transport: Send + Sync {
    /// Create a connection for shard `part`
    fn connect(&self, part: usize) -> Box<dyn Connection>;

    /// Called after a request on shard `part` failed
    fn on_request_failure(&self, _conn: &mut dyn Connection, _part: usize) -> RequestFailure {
        RequestFailure::Unhandled
    }

    /// Called when a request stops relying on the source of shard `part`.
    ///
    /// Transports that pool sources can use it to avoid the source for
    /// later requests.
    fn on_source_demoted(&self, _part: usize, _reason: Demotion) {}

    /// Time from posting a request on shard `part` to its complete response
    fn on_request_latency(&self, _part: usize, _latency: Duration) {}

    /// Called once when a request using this transport gives up
    fn on_transfer_failure(&self, _failure: &Failure) {}

    /// Return a connection that is no longer needed
    fn disconnect(&self, mut conn: Box<dyn Connection>) {
        conn.abort();
    }
}

/// A single shard connection, exclusively owned by one fetcher
pub trait Connection: Send {
    /// Prepare a ranged read of `url`
    fn prepare(&mut self, url: &str, range: Range<u64>);

    /// Start the prepared request.
    ///
    /// Returns false if the request could not be issued. The transport
    /// must call `waker.wake()` once the outcome is available.
    fn post(&mut self, waker: ShardWaker) -> bool;

    /// Current state of the posted request
    fn poll(&mut self) -> TransferStatus;

    /// Time bytes were last seen on the wire, if the transport tracks it
    fn last_activity(&self) -> Option<Instant> {
        None
    }

    /// Cancel any outstanding request
    fn abort(&mut self) {}
}

/// Re-queues a shard fetcher on its scheduler
#[derive(Clone)]
pub struct ShardWaker {
    queue: Weak<WorkQueue>,
    task: Task,
}

impl ShardWaker {
    pub(crate) fn new(queue: &Arc<WorkQueue>, task: Task) -> Self {
        ShardWaker {
            queue: Arc::downgrade(queue),
            task,
        }
    }

    /// A waker that is not attached to any scheduler
    pub fn detached(part: usize) -> Self {
        ShardWaker {
            queue: Weak::new(),
            task: Task::detached(part),
        }
    }

    /// Shard index this waker belongs to
    pub fn part(&self) -> usize {
        self.task.part
    }

    /// Schedule the fetcher for another step. Does nothing once the scheduler is gone.
    pub fn wake(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.push(self.task);
        }
    }
}

impl std::fmt::Debug for ShardWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWaker").field("task", &self.task).finish()
    }
}
