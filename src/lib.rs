//! CloudRAID - retrieval engine for files striped over six cloud shards
//!
//! A file is split into five data shards plus one XOR parity shard, each
//! stored at its own URL. The engine fetches the shards in parallel,
//! reconstructs the plaintext line by line while tolerating one missing
//! or misbehaving source, and hands the bytes to the caller in order.

pub mod config;
pub mod error;
pub mod metrics;
pub mod raid;
pub mod scheduler;
pub mod transport;

pub use config::Config;
pub use error::{Error, Failure, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Failure, Result};
    pub use crate::raid::{RequestParams, RequestStats};
    pub use crate::scheduler::{RequestHandle, SchedulerGroup};
    pub use crate::transport::{Connection, Transport};
}
