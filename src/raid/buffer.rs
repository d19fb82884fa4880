//! Striped reconstruction buffer
//!
//! Holds a window of `num_lines` RAID lines starting at `dataline`.
//! Data shards land in their column of each line, parity lands in a
//! separate buffer, and a per-line bitmask tracks which shards are
//! still unknown. Bytes that arrive ahead of a shard's cursor wait in
//! that shard's readahead map until they become contiguous.

use super::{
    load_sector, store_sector, Sector, ALL_INVALID, RAIDLINE, RAIDPARTS, RAIDSECTOR,
};
use bytes::{Buf, Bytes};
use std::collections::BTreeMap;

/// Striped data and parity buffers with out-of-order readahead
pub struct ReconstructionBuffer {
    num_lines: usize,
    data: Vec<u8>,
    parity: Vec<u8>,
    invalid: Vec<u8>,
    /// Absolute index of the first buffered line
    dataline: u64,
    /// Bytes already delivered from the first line
    skip: usize,
    /// Lines at the front of the buffer that are fully known
    completed: usize,
    /// Bytes buffered per shard, relative to `dataline`
    part_pos: [usize; RAIDPARTS],
    readahead: [BTreeMap<u64, Bytes>; RAIDPARTS],
}

impl ReconstructionBuffer {
    /// Create a buffer of `num_lines` lines positioned at plaintext offset `start`
    pub fn new(num_lines: usize, start: u64) -> Self {
        let num_lines = num_lines.max(1);
        let line = RAIDLINE as u64;

        ReconstructionBuffer {
            num_lines,
            data: vec![0; num_lines * RAIDLINE],
            parity: vec![0; num_lines * RAIDSECTOR],
            invalid: vec![ALL_INVALID; num_lines],
            dataline: start / line,
            skip: (start % line) as usize,
            completed: 0,
            part_pos: [0; RAIDPARTS],
            readahead: Default::default(),
        }
    }

    pub fn num_lines(&self) -> usize {
        self.num_lines
    }

    /// Bytes of one shard the buffer can hold
    pub fn capacity(&self) -> usize {
        self.num_lines * RAIDSECTOR
    }

    pub fn dataline(&self) -> u64 {
        self.dataline
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Absolute index one past the last fully known line; never decreases
    pub fn completed_line(&self) -> u64 {
        self.dataline + self.completed as u64
    }

    /// Shard offset of the first buffered line
    pub fn base_pos(&self) -> u64 {
        self.dataline * RAIDSECTOR as u64
    }

    pub fn part_pos(&self, part: usize) -> usize {
        self.part_pos[part]
    }

    /// Shard offset up to which `part` has been absorbed
    pub fn part_cursor(&self, part: usize) -> u64 {
        self.base_pos() + self.part_pos[part] as u64
    }

    /// Shard offset one past the end of the buffer window
    pub fn window_end(&self) -> u64 {
        self.base_pos() + self.capacity() as u64
    }

    pub fn invalid_mask(&self, line: usize) -> u8 {
        self.invalid[line]
    }

    /// Reconstructed plaintext ready for delivery
    pub fn readable(&self) -> &[u8] {
        let end = self.completed * RAIDLINE;
        if self.skip >= end {
            return &[];
        }
        &self.data[self.skip..end]
    }

    /// Number of readahead entries held for `part`
    pub fn readahead_len(&self, part: usize) -> usize {
        self.readahead[part].len()
    }

    /// Bytes held as readahead for `part`
    pub fn readahead_bytes(&self, part: usize) -> usize {
        self.readahead[part].values().map(Bytes::len).sum()
    }

    pub fn readahead_is_empty(&self, part: usize) -> bool {
        self.readahead[part].is_empty()
    }

    /// Contiguous `[start, end)` runs covered by the readahead of `part`
    pub fn readahead_runs(&self, part: usize) -> Vec<(u64, u64)> {
        let mut runs: Vec<(u64, u64)> = Vec::new();

        for (&pos, bytes) in &self.readahead[part] {
            let end = pos + bytes.len() as u64;
            match runs.last_mut() {
                Some(run) if run.1 >= pos => run.1 = run.1.max(end),
                _ => runs.push((pos, end)),
            }
        }

        runs
    }

    /// Hand bytes of shard `part` starting at shard offset `pos` to the buffer.
    ///
    /// Bytes already absorbed are dropped. Non-contiguous bytes and
    /// bytes past the window end are kept as readahead. Returns true
    /// when more lines became complete.
    pub fn absorb(&mut self, part: usize, mut bytes: Bytes, mut pos: u64) -> bool {
        let cursor = self.part_cursor(part);

        if pos < cursor {
            let overlap = cursor - pos;
            if overlap >= bytes.len() as u64 {
                return false;
            }
            bytes.advance(overlap as usize);
            pos = cursor;
        }

        if bytes.is_empty() {
            return false;
        }

        if pos != cursor {
            self.stash(part, pos, bytes);
            return false;
        }

        let window_end = self.window_end();
        if pos + bytes.len() as u64 > window_end {
            let tail = bytes.split_off((window_end - pos) as usize);
            self.stash(part, window_end, tail);
            if bytes.is_empty() {
                return false;
            }
        }

        self.store(part, &bytes)
    }

    /// Feed readahead of `part` that has become contiguous.
    ///
    /// Returns true when at least one entry was absorbed.
    pub fn feed_readahead(&mut self, part: usize) -> bool {
        let mut fed = false;

        while let Some(&pos) = self.readahead[part].keys().next() {
            let cursor = self.part_cursor(part);

            if pos < cursor {
                if let Some(bytes) = self.readahead[part].remove(&pos) {
                    let overlap = (cursor - pos) as usize;
                    if overlap < bytes.len() {
                        self.stash(part, cursor, bytes.slice(overlap..));
                    }
                }
                continue;
            }

            // a lagging shard may take over exactly at the completed boundary
            let completed_pos = self.base_pos() + (self.completed * RAIDSECTOR) as u64;
            if pos > cursor && pos == completed_pos {
                self.part_pos[part] = self.completed * RAIDSECTOR;
            }

            if pos != self.part_cursor(part) || pos >= self.window_end() {
                break;
            }

            let Some(bytes) = self.readahead[part].remove(&pos) else {
                break;
            };
            self.absorb(part, bytes, pos);
            fed = true;
        }

        fed
    }

    /// Release `len` delivered bytes and shift out the consumed lines.
    ///
    /// Returns the number of whole lines shifted out.
    pub fn advance(&mut self, len: usize) -> usize {
        self.skip += len;

        let shift = (self.skip / RAIDLINE).min(self.completed);
        if shift == 0 {
            return 0;
        }

        self.skip -= shift * RAIDLINE;
        self.completed -= shift;

        let data_end = self.part_pos[1..]
            .iter()
            .map(|&p| p.div_ceil(RAIDSECTOR))
            .max()
            .unwrap_or(0);
        let all_end = data_end.max(self.part_pos[0].div_ceil(RAIDSECTOR));

        if data_end > shift {
            self.data.copy_within(shift * RAIDLINE..data_end * RAIDLINE, 0);
        }

        if self.part_pos[0] > shift * RAIDSECTOR {
            self.parity
                .copy_within(shift * RAIDSECTOR..self.part_pos[0], 0);
        }

        if all_end > shift {
            self.invalid.copy_within(shift..all_end, 0);
            self.invalid[all_end - shift..all_end].fill(ALL_INVALID);
        } else {
            self.invalid[..shift].fill(ALL_INVALID);
        }

        self.dataline += shift as u64;
        for pos in &mut self.part_pos {
            *pos = pos.saturating_sub(shift * RAIDSECTOR);
        }

        shift
    }

    /// Drop every readahead entry
    pub fn clear_readahead(&mut self) {
        for entries in &mut self.readahead {
            entries.clear();
        }
    }

    fn stash(&mut self, part: usize, pos: u64, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }

        let entry = self.readahead[part].entry(pos).or_default();
        if entry.len() < bytes.len() {
            *entry = bytes;
        }
    }

    fn store(&mut self, part: usize, bytes: &[u8]) -> bool {
        let offset = self.part_pos[part];
        let len = bytes.len();
        self.part_pos[part] += len;

        let mask = 1u8 << part;
        let until = (offset + len) / RAIDSECTOR;
        for line in offset / RAIDSECTOR..until {
            self.invalid[line] &= !mask;
        }

        if part == 0 {
            self.parity[offset..offset + len].copy_from_slice(bytes);
        } else {
            let column = (part - 1) * RAIDSECTOR;
            let mut written = 0;

            while written < len {
                let at = offset + written;
                let within = at % RAIDSECTOR;
                let n = (RAIDSECTOR - within).min(len - written);
                let dst = (at / RAIDSECTOR) * RAIDLINE + column + within;

                self.data[dst..dst + n].copy_from_slice(&bytes[written..written + n]);
                written += n;
            }
        }

        self.merge_completed(until)
    }

    fn merge_completed(&mut self, until: usize) -> bool {
        let before = self.completed;

        while self.completed < until {
            let mask = self.invalid[self.completed];
            if mask.count_ones() > 1 {
                break;
            }

            // parity alone missing needs no work
            if mask > 1 {
                self.rebuild_sector(self.completed, mask.trailing_zeros() as usize);
            }

            self.completed += 1;
        }

        self.completed > before
    }

    fn rebuild_sector(&mut self, line: usize, missing: usize) {
        let row = line * RAIDLINE;
        let mut acc: Sector = load_sector(&self.parity[line * RAIDSECTOR..]);

        for part in (1..RAIDPARTS).filter(|&p| p != missing) {
            acc ^= load_sector(&self.data[row + (part - 1) * RAIDSECTOR..]);
        }

        store_sector(&mut self.data[row + (missing - 1) * RAIDSECTOR..], acc);
    }
}
