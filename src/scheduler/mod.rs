//! I/O schedulers
//!
//! Each [`Scheduler`] owns one worker thread that steps shard fetchers
//! for every request registered with it. Work arrives as [`Task`]s in a
//! [`WorkQueue`]: transports push them when a response is ready, and
//! fetchers schedule them for retries after a backoff.

pub mod group;

pub use group::{RequestHandle, RequestToken, SchedulerGroup};

use crate::error::{Error, Result};
use crate::raid::request::SharedRequest;
use crate::raid::RequestId;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, trace};

/// One unit of work: step shard `part` of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Task {
    pub(crate) request: RequestId,
    pub(crate) part: usize,
}

impl Task {
    pub(crate) fn new(request: RequestId, part: usize) -> Self {
        Task { request, part }
    }

    pub(crate) fn detached(part: usize) -> Self {
        Task::new(RequestId::new(0), part)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Task>,
    queued: HashSet<Task>,
    scheduled: BinaryHeap<Reverse<(Instant, Task)>>,
    shutdown: bool,
}

impl QueueState {
    fn enqueue(&mut self, task: Task) -> bool {
        if self.queued.insert(task) {
            self.ready.push_back(task);
            return true;
        }
        false
    }

    /// Move due timers to the ready set; returns the next pending deadline
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        while let Some(Reverse((at, task))) = self.scheduled.peek().copied() {
            if at > now {
                return Some(at);
            }
            self.scheduled.pop();
            self.enqueue(task);
        }
        None
    }

    fn take_ready(&mut self) -> Vec<Task> {
        self.queued.clear();
        self.ready.drain(..).collect()
    }
}

/// Ready set plus timer heap, shared between a worker and its wakers
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `task` ready now
    pub fn push(&self, task: Task) {
        let added = self.state.lock().enqueue(task);
        if added {
            self.wakeup.notify_one();
        }
    }

    /// Make `task` ready at `at`
    pub fn schedule(&self, at: Instant, task: Task) {
        self.state.lock().scheduled.push(Reverse((at, task)));
        self.wakeup.notify_one();
    }

    /// Stop the worker at its next wake
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wakeup.notify_all();
    }

    /// Take everything that is due at `now` without blocking
    pub fn drain_due(&self, now: Instant) -> Vec<Task> {
        let mut state = self.state.lock();
        state.promote_due(now);
        state.take_ready()
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().scheduled.peek().map(|Reverse((at, _))| *at)
    }

    /// Block until work is due; None after shutdown
    fn next_batch(&self) -> Option<Vec<Task>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }

            let deadline = state.promote_due(Instant::now());
            if !state.ready.is_empty() {
                return Some(state.take_ready());
            }

            match deadline {
                Some(at) => {
                    self.wakeup.wait_until(&mut state, at);
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

pub(crate) type Registry = Mutex<HashMap<RequestId, Arc<SharedRequest>>>;

/// Remove request `id` from `registry` and disconnect it; false if it was not there
pub(crate) fn unregister(registry: &Registry, id: RequestId) -> bool {
    let mut registry = registry.lock();
    match registry.remove(&id) {
        Some(request) => {
            request.shut_down();
            true
        }
        None => false,
    }
}

/// A worker thread and the requests it drives
pub struct Scheduler {
    index: usize,
    queue: Arc<WorkQueue>,
    registry: Arc<Registry>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start a scheduler thread
    pub fn spawn(index: usize) -> Result<Self> {
        let queue = WorkQueue::new();
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));

        let worker = {
            let queue = queue.clone();
            let registry = registry.clone();
            std::thread::Builder::new()
                .name(format!("cloudraid-io-{}", index))
                .spawn(move || run(index, &queue, &registry))
                .map_err(|e| Error::Internal(format!("failed to start scheduler {}: {}", index, e)))?
        };

        Ok(Scheduler {
            index,
            queue,
            registry,
            worker: Some(worker),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Number of active requests
    pub fn load(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn register(&self, request: Arc<SharedRequest>) {
        self.registry.lock().insert(request.id(), request);
    }

    /// Disconnect and forget a request; false if it was not registered here
    pub(crate) fn remove(&self, id: RequestId) -> bool {
        unregister(&self.registry, id)
    }

    pub(crate) fn registry(&self) -> Weak<Registry> {
        Arc::downgrade(&self.registry)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let mut registry = self.registry.lock();
        for (_, request) in registry.drain() {
            request.shut_down();
        }
        debug!("scheduler {} stopped", self.index);
    }
}

fn run(index: usize, queue: &WorkQueue, registry: &Registry) {
    debug!("scheduler {} started", index);

    while let Some(batch) = queue.next_batch() {
        // held across lookup and dispatch so a removed request is never stepped
        let registry = registry.lock();
        let mut contended = Vec::new();

        for task in batch {
            match registry.get(&task.request) {
                Some(request) => {
                    if !request.try_dispatch(task.part) {
                        contended.push(task);
                    }
                }
                None => trace!("dropping task for finished request {}", task.request),
            }
        }

        for task in contended {
            if let Some(request) = registry.get(&task.request) {
                request.dispatch(task.part);
            }
        }
    }
}
