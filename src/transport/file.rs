//! Local-file transport
//!
//! Treats shard URLs as filesystem paths (optionally `file://`) and
//! serves ranged reads from a tokio runtime.

use super::{Connection, ShardWaker, TransferStatus, Transport};
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Transport reading shard files through `tokio::fs`
#[derive(Clone)]
pub struct FileTransport {
    runtime: Handle,
}

impl FileTransport {
    pub fn new(runtime: Handle) -> Self {
        FileTransport { runtime }
    }

    /// Use the runtime of the calling context
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::new(runtime))
    }
}

impl Transport for FileTransport {
    fn connect(&self, part: usize) -> Box<dyn Connection> {
        Box::new(FileConnection {
            part,
            runtime: self.runtime.clone(),
            prepared: None,
            state: Arc::new(Mutex::new(ReadState::Idle)),
            task: None,
        })
    }
}

enum ReadState {
    Idle,
    Reading { last_activity: Instant },
    Done(Bytes),
    Failed(String),
}

struct FileConnection {
    part: usize,
    runtime: Handle,
    prepared: Option<(PathBuf, Range<u64>)>,
    state: Arc<Mutex<ReadState>>,
    task: Option<JoinHandle<()>>,
}

fn url_to_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

async fn read_range(path: &Path, range: Range<u64>) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let len = range.end.saturating_sub(range.start);
    let mut body = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut body).await?;
    Ok(body)
}

impl Connection for FileConnection {
    fn prepare(&mut self, url: &str, range: Range<u64>) {
        self.abort();
        self.prepared = Some((url_to_path(url), range));
    }

    fn post(&mut self, waker: ShardWaker) -> bool {
        let Some((path, range)) = self.prepared.take() else {
            return false;
        };

        let state = self.state.clone();
        *state.lock() = ReadState::Reading {
            last_activity: Instant::now(),
        };

        let part = self.part;
        self.task = Some(self.runtime.spawn(async move {
            let outcome = match read_range(&path, range).await {
                Ok(body) => ReadState::Done(Bytes::from(body)),
                Err(e) => {
                    debug!("shard {} read of {:?} failed: {}", part, path, e);
                    ReadState::Failed(e.to_string())
                }
            };
            *state.lock() = outcome;
            waker.wake();
        }));

        true
    }

    fn poll(&mut self) -> TransferStatus {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ReadState::Idle) {
            ReadState::Done(body) => TransferStatus::Complete(body),
            ReadState::Failed(reason) => TransferStatus::Failed(reason),
            reading @ ReadState::Reading { .. } => {
                *state = reading;
                TransferStatus::InFlight
            }
            ReadState::Idle => TransferStatus::Failed("no request posted".to_string()),
        }
    }

    fn last_activity(&self) -> Option<Instant> {
        match &*self.state.lock() {
            ReadState::Reading { last_activity } => Some(*last_activity),
            _ => None,
        }
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = Arc::new(Mutex::new(ReadState::Idle));
    }
}
