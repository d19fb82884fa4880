//! CloudRAID geometry and retrieval engine
//!
//! A file is striped over six shards: shard 0 holds the XOR parity of
//! the five data shards 1..5. Each RAID line spans one 16-byte sector
//! from every data shard, so any single missing shard can be rebuilt
//! line by line from the other five.

pub mod buffer;
pub mod fetcher;
pub mod request;

pub use buffer::ReconstructionBuffer;
pub use fetcher::FetchState;
pub use request::{Mode, RequestId, RequestParams, RequestStats, ShardStats};

/// Number of shards, parity included
pub const RAIDPARTS: usize = 6;

/// Number of data shards
pub const DATA_PARTS: usize = RAIDPARTS - 1;

/// Per-shard atomic unit, one `u128` word
pub const RAIDSECTOR: usize = 16;

/// One reconstructable stripe of plaintext
pub const RAIDLINE: usize = RAIDSECTOR * DATA_PARTS;

/// Upper bound on the RAID lines held by one request
pub const MAX_NUMLINES: usize = 4096;

/// Shift cycles between slow-source evaluations
pub const LAG_INTERVAL: u32 = 256;

/// How many times the laggiest shard must trail the quickest before it counts as slow
pub const LAG_DOMINANCE: u64 = 16;

/// Invalid mask of a line for which nothing has arrived yet
pub(crate) const ALL_INVALID: u8 = (1 << RAIDPARTS) - 1;

pub(crate) type Sector = u128;

const _: () = assert!(RAIDSECTOR == std::mem::size_of::<Sector>());

/// Byte length of shard `part` for a file of `filesize` bytes.
///
/// Whole lines contribute one sector to every shard. The bytes of a
/// trailing partial line are dealt to the data shards in order, and the
/// parity shard is as long as the first data shard.
pub fn raid_part_size(part: usize, filesize: u64) -> u64 {
    let line = RAIDLINE as u64;
    let sector = RAIDSECTOR as u64;
    let residual = filesize % line;
    let preceding = part.saturating_sub(1) as u64 * sector;
    let tail = residual.saturating_sub(preceding).min(sector);

    (filesize - residual) / DATA_PARTS as u64 + tail
}

/// Shard length rounded up to a whole sector, shared by every shard
pub fn padded_part_size(filesize: u64) -> u64 {
    round_up_to_sector(raid_part_size(0, filesize))
}

/// Number of RAID lines worth buffering for a file of `filesize` bytes
pub fn buffer_lines(filesize: u64, max_lines: usize) -> usize {
    let lines = filesize.div_ceil(RAIDLINE as u64);
    (lines.min(max_lines as u64) as usize).max(1)
}

pub(crate) fn sector_floor(offset: u64) -> u64 {
    offset & !(RAIDSECTOR as u64 - 1)
}

pub(crate) fn round_up_to_sector(offset: u64) -> u64 {
    sector_floor(offset + RAIDSECTOR as u64 - 1)
}

pub(crate) fn load_sector(bytes: &[u8]) -> Sector {
    let mut word = [0u8; RAIDSECTOR];
    word.copy_from_slice(&bytes[..RAIDSECTOR]);
    Sector::from_ne_bytes(word)
}

pub(crate) fn store_sector(bytes: &mut [u8], value: Sector) {
    bytes[..RAIDSECTOR].copy_from_slice(&value.to_ne_bytes());
}

/// Split `data` into the six shard bodies, parity first.
///
/// Each body is truncated to [`raid_part_size`]; readers pad the tail
/// sector with zeros, which keeps the parity consistent.
pub fn encode(data: &[u8]) -> Vec<Vec<u8>> {
    let filesize = data.len() as u64;
    let lines = data.len().div_ceil(RAIDLINE);
    let mut shards = vec![vec![0u8; lines * RAIDSECTOR]; RAIDPARTS];

    for (line, chunk) in data.chunks(RAIDLINE).enumerate() {
        let at = line * RAIDSECTOR;
        let mut parity: Sector = 0;

        for (column, sector) in chunk.chunks(RAIDSECTOR).enumerate() {
            let shard = &mut shards[column + 1][at..at + RAIDSECTOR];
            shard[..sector.len()].copy_from_slice(sector);
            parity ^= load_sector(shard);
        }

        store_sector(&mut shards[0][at..], parity);
    }

    for (part, shard) in shards.iter_mut().enumerate() {
        shard.truncate(raid_part_size(part, filesize) as usize);
    }

    shards
}
