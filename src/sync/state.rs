// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Per-consumer record of which part of the chain has been handed over.

use std::io::{Read, Write};

use crate::codec::{self, StreamError};
use crate::crypto::Hash256;

const STATE_STREAM_VERSION: u8 = 1;

/// Outcome of matching a received block interval against the known chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub detach_required: bool,
    /// First height at which the interval contradicts the known chain.
    pub detach_height: u32,
    pub has_new_blocks: bool,
    /// Height of the first block the consumer has not seen.
    pub new_block_height: u32,
}

/// Dense list of known block hashes, indexed by height. The genesis hash is
/// always present at height zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizationState {
    known_blocks: Vec<Hash256>,
}

impl SynchronizationState {
    #[must_use]
    pub fn new(genesis_hash: Hash256) -> Self {
        Self {
            known_blocks: vec![genesis_hash],
        }
    }

    #[must_use]
    pub fn genesis_hash(&self) -> Hash256 {
        self.known_blocks[0]
    }

    /// Number of known blocks, genesis included. The consumer's horizon.
    #[must_use]
    pub fn known_block_count(&self) -> usize {
        self.known_blocks.len()
    }

    /// Sparse history for `query_blocks`, newest first: the last ten blocks
    /// one by one, then strides doubling back, the genesis always last.
    #[must_use]
    pub fn short_history(&self) -> Vec<Hash256> {
        let mut history = Vec::new();
        let mut index = self.known_blocks.len() - 1;
        let mut taken = 0usize;

        while index > 0 {
            history.push(self.known_blocks[index]);
            taken += 1;
            let stride = if taken < 10 {
                1
            } else {
                1usize << (taken - 10).min(31)
            };
            index = index.saturating_sub(stride);
        }
        history.push(self.known_blocks[0]);
        history
    }

    /// Matches a `query_blocks` interval against the known chain. The first
    /// hash mismatch demands a detach at that height; the first height past
    /// the horizon marks where new blocks begin. At most one of the two
    /// events fires per call site action, checked in interval order.
    #[must_use]
    pub fn check_interval(&self, start_height: u32, block_hashes: &[Hash256]) -> CheckResult {
        let mut result = CheckResult {
            detach_required: false,
            detach_height: 0,
            has_new_blocks: false,
            new_block_height: 0,
        };

        for (offset, hash) in block_hashes.iter().enumerate() {
            let height = start_height as usize + offset;
            if height >= self.known_blocks.len() {
                result.has_new_blocks = true;
                result.new_block_height = height as u32;
                break;
            }
            if self.known_blocks[height] != *hash {
                result.detach_required = true;
                result.detach_height = height as u32;
                result.has_new_blocks = true;
                result.new_block_height = height as u32;
                break;
            }
        }

        result
    }

    /// Truncates the known chain to `[0, height)`. The genesis survives any
    /// detach.
    pub fn detach(&mut self, height: u32) {
        let keep = (height as usize).max(1);
        self.known_blocks.truncate(keep);
    }

    /// Appends hashes at the horizon. Returns false when `start_height` is
    /// not exactly the current horizon.
    pub fn add_blocks(&mut self, start_height: u32, hashes: &[Hash256]) -> bool {
        if start_height as usize != self.known_blocks.len() {
            return false;
        }
        self.known_blocks.extend_from_slice(hashes);
        true
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), StreamError> {
        codec::write_header(writer, STATE_STREAM_VERSION)
            .map_err(|_| StreamError::Truncated)?;
        codec::encode_into(writer, &self.known_blocks).map_err(|_| StreamError::Truncated)
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self, StreamError> {
        codec::read_header(reader, STATE_STREAM_VERSION)?;
        let known_blocks: Vec<Hash256> =
            codec::decode_from(reader).map_err(|_| StreamError::Truncated)?;
        if known_blocks.is_empty() {
            return Err(StreamError::Truncated);
        }
        Ok(Self { known_blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u32) -> Hash256 {
        Hash256::hash_from_slice(n.to_le_bytes())
    }

    fn state_with_blocks(count: u32) -> SynchronizationState {
        let mut state = SynchronizationState::new(hash(0));
        let hashes: Vec<Hash256> = (1..=count).map(hash).collect();
        assert!(state.add_blocks(1, &hashes));
        state
    }

    #[test]
    fn short_history_starts_at_tip_and_ends_at_genesis() {
        let state = state_with_blocks(100);
        let history = state.short_history();

        assert_eq!(history[0], hash(100));
        assert_eq!(*history.last().unwrap(), hash(0));
        // Dense near the tip, sparse behind it.
        assert_eq!(&history[..10], &(91..=100).rev().map(hash).collect::<Vec<_>>()[..]);
        assert!(history.len() < 25);
    }

    #[test]
    fn short_history_of_fresh_state_is_genesis_only() {
        let state = SynchronizationState::new(hash(0));
        assert_eq!(state.short_history(), vec![hash(0)]);
    }

    #[test]
    fn check_interval_detects_new_blocks() {
        let state = state_with_blocks(5);
        let result = state.check_interval(4, &[hash(4), hash(5), hash(6), hash(7)]);

        assert!(!result.detach_required);
        assert!(result.has_new_blocks);
        assert_eq!(result.new_block_height, 6);
    }

    #[test]
    fn check_interval_detects_fork() {
        let state = state_with_blocks(5);
        let fork = Hash256::hash_from_slice(b"fork");
        let result = state.check_interval(3, &[hash(3), fork, fork]);

        assert!(result.detach_required);
        assert_eq!(result.detach_height, 4);
        assert!(result.has_new_blocks);
        assert_eq!(result.new_block_height, 4);
    }

    #[test]
    fn check_interval_with_nothing_new() {
        let state = state_with_blocks(5);
        let result = state.check_interval(2, &[hash(2), hash(3)]);
        assert!(!result.detach_required);
        assert!(!result.has_new_blocks);
    }

    #[test]
    fn detach_then_add_blocks() {
        let mut state = state_with_blocks(5);
        state.detach(3);
        assert_eq!(state.known_block_count(), 3);

        assert!(!state.add_blocks(5, &[hash(9)]));
        assert!(state.add_blocks(3, &[hash(9)]));
        assert_eq!(state.known_block_count(), 4);
    }

    #[test]
    fn detach_never_drops_genesis() {
        let mut state = state_with_blocks(5);
        state.detach(0);
        assert_eq!(state.known_block_count(), 1);
        assert_eq!(state.genesis_hash(), hash(0));
    }

    #[test]
    fn save_load_roundtrip() {
        let state = state_with_blocks(17);
        let mut buf = Vec::new();
        state.save(&mut buf).unwrap();
        assert_eq!(SynchronizationState::load(&mut &buf[..]).unwrap(), state);
    }
}
