//! In-memory transport with fault injection
//!
//! Shard bodies live in a URL-keyed map. Faults are attached per shard
//! index so a test can make one source fail, hang or run late.

use super::{Connection, Demotion, RequestFailure, ShardWaker, TransferStatus, Transport};
use crate::error::Failure;
use crate::raid::{encode, RAIDPARTS};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Misbehaviour injected into every request for one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The request cannot be posted
    Fail,
    /// The next `n` requests fail after posting
    FailTimes(u32),
    /// Requests are accepted and never answered
    Hang,
    /// Requests fail and the transport reports the failure as permanent
    Permanent,
    /// Responses arrive after the given delay
    Delay(Duration),
}

#[derive(Default)]
struct Shared {
    objects: Mutex<HashMap<String, Bytes>>,
    faults: Mutex<HashMap<usize, Fault>>,
    posts: AtomicUsize,
    transfer_failures: AtomicUsize,
    demotions: Mutex<Vec<(usize, Demotion)>>,
    latency_samples: AtomicUsize,
}

impl Shared {
    /// Fault applying to the next request of `part`, consuming a `FailTimes` credit
    fn take_fault(&self, part: usize) -> Option<Fault> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&part) {
            Some(Fault::FailTimes(0)) => {
                faults.remove(&part);
                None
            }
            Some(Fault::FailTimes(n)) => {
                *n -= 1;
                Some(Fault::FailTimes(*n))
            }
            Some(fault) => Some(*fault),
            None => None,
        }
    }

    fn read(&self, url: &str, range: Range<u64>) -> Option<Bytes> {
        let objects = self.objects.lock();
        let body = objects.get(url)?;
        let len = body.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len) as usize;
        Some(body.slice(start..end))
    }
}

/// Transport serving shard bodies from memory
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a body under `url`
    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.shared.objects.lock().insert(url.into(), body.into());
    }

    /// Encode `data` into shards stored under `mem://{name}/partN` and return their URLs
    pub fn publish(&self, name: &str, data: &[u8]) -> Vec<String> {
        encode(data)
            .into_iter()
            .enumerate()
            .map(|(part, shard)| {
                let url = format!("mem://{}/part{}", name, part);
                self.insert(url.clone(), shard);
                url
            })
            .collect()
    }

    /// Attach a fault to every later request for shard `part`
    pub fn set_fault(&self, part: usize, fault: Fault) {
        debug_assert!(part < RAIDPARTS);
        self.shared.faults.lock().insert(part, fault);
    }

    pub fn clear_fault(&self, part: usize) {
        self.shared.faults.lock().remove(&part);
    }

    /// Requests posted so far
    pub fn posts(&self) -> usize {
        self.shared.posts.load(Ordering::Relaxed)
    }

    /// Requests that gave up on this transport
    pub fn transfer_failures(&self) -> usize {
        self.shared.transfer_failures.load(Ordering::Relaxed)
    }

    /// Sources demoted so far, oldest first
    pub fn demotions(&self) -> Vec<(usize, Demotion)> {
        self.shared.demotions.lock().clone()
    }

    /// Completed responses whose latency was reported
    pub fn latency_samples(&self) -> usize {
        self.shared.latency_samples.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, part: usize) -> Box<dyn Connection> {
        Box::new(MemoryConnection {
            part,
            shared: self.shared.clone(),
            prepared: None,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            last_activity: None,
        })
    }

    fn on_request_failure(&self, _conn: &mut dyn Connection, part: usize) -> RequestFailure {
        match self.shared.faults.lock().get(&part) {
            Some(Fault::Permanent) => RequestFailure::Permanent("source refused".to_string()),
            _ => RequestFailure::Unhandled,
        }
    }

    fn on_source_demoted(&self, part: usize, reason: Demotion) {
        self.shared.demotions.lock().push((part, reason));
    }

    fn on_request_latency(&self, part: usize, latency: Duration) {
        trace!("shard {} answered in {:?}", part, latency);
        self.shared.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn on_transfer_failure(&self, _failure: &Failure) {
        self.shared.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }
}

enum Slot {
    Idle,
    InFlight,
    Done(Bytes),
    Failed(String),
}

struct MemoryConnection {
    part: usize,
    shared: Arc<Shared>,
    prepared: Option<(String, Range<u64>)>,
    slot: Arc<Mutex<Slot>>,
    last_activity: Option<Instant>,
}

impl Connection for MemoryConnection {
    fn prepare(&mut self, url: &str, range: Range<u64>) {
        self.prepared = Some((url.to_string(), range));
        *self.slot.lock() = Slot::Idle;
    }

    fn post(&mut self, waker: ShardWaker) -> bool {
        let Some((url, range)) = self.prepared.take() else {
            return false;
        };

        self.shared.posts.fetch_add(1, Ordering::Relaxed);
        self.last_activity = Some(Instant::now());
        trace!("shard {} GET {} [{}, {})", self.part, url, range.start, range.end);

        let fault = self.shared.take_fault(self.part);
        let outcome = match self.shared.read(&url, range) {
            Some(body) => Slot::Done(body),
            None => Slot::Failed(format!("{} not found", url)),
        };

        let next = match fault {
            Some(Fault::Fail) => return false,
            Some(Fault::FailTimes(_)) | Some(Fault::Permanent) => {
                Slot::Failed("injected failure".to_string())
            }
            Some(Fault::Hang) => Slot::InFlight,
            Some(Fault::Delay(delay)) => {
                let slot = self.slot.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    *slot.lock() = outcome;
                    waker.wake();
                });
                Slot::InFlight
            }
            None => outcome,
        };

        *self.slot.lock() = next;
        true
    }

    fn poll(&mut self) -> TransferStatus {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Done(body) => TransferStatus::Complete(body),
            Slot::Failed(reason) => TransferStatus::Failed(reason),
            Slot::InFlight => {
                *slot = Slot::InFlight;
                TransferStatus::InFlight
            }
            Slot::Idle => TransferStatus::Failed("no request posted".to_string()),
        }
    }

    fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    fn abort(&mut self) {
        self.prepared = None;
        *self.slot.lock() = Slot::Idle;
    }
}
