// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Seam to the remote daemon. Everything the synchronizer and the consumers
//! need from the network lives behind [`NodeBackend`]; implementations block
//! the calling thread (the synchronizer calls from its own worker).

use bincode::{Decode, Encode};
use std::fmt;

use crate::crypto::Hash256;
use crate::primitives::{Amount, GlobalOutput, Transaction, TransactionPrefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    Timeout,
    ConnectionLost,
    InternalNodeError,
    NotFound,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Timeout => write!(f, "node request timed out"),
            NodeError::ConnectionLost => write!(f, "connection to node lost"),
            NodeError::InternalNodeError => write!(f, "internal node error"),
            NodeError::NotFound => write!(f, "requested object not found"),
        }
    }
}

impl std::error::Error for NodeError {}

/// A transaction as delivered by the node: prefix plus its hash, so
/// consumers never rehash while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransactionEntry {
    pub hash: Hash256,
    pub prefix: TransactionPrefix,
}

/// One block of a `query_blocks` response. The height is implied:
/// `start_height + position` within the batch.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockEntry {
    pub block_hash: Hash256,
    pub timestamp: u64,
    pub transactions: Vec<TransactionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBlocksResult {
    /// Height of the first block in `blocks`, which is the last block the
    /// node found in common with `known_ids`.
    pub start_height: u32,
    pub blocks: Vec<BlockEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDifference {
    /// False when `last_block` is no longer the node's chain tip; the caller
    /// must resynchronize the chain before trusting the pool view.
    pub is_last_known_block_actual: bool,
    pub added: Vec<TransactionEntry>,
    pub deleted: Vec<Hash256>,
}

/// Random ring member candidates for one amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomAmountOuts {
    pub amount: Amount,
    pub outputs: Vec<GlobalOutput>,
}

pub trait NodeBackend: Send + Sync {
    /// Returns blocks following the best block of `known_ids` found in the
    /// node's main chain. `known_ids` is a sparse history, newest first,
    /// ending with the genesis hash. `timestamp` lets the node skip block
    /// bodies older than the caller cares about.
    fn query_blocks(
        &self,
        known_ids: Vec<Hash256>,
        timestamp: u64,
    ) -> Result<QueryBlocksResult, NodeError>;

    /// Symmetric difference between `known_ids` and the node's pool, valid
    /// relative to `last_block`.
    fn get_pool_symmetric_difference(
        &self,
        known_ids: Vec<Hash256>,
        last_block: Hash256,
    ) -> Result<PoolDifference, NodeError>;

    /// Global output indices of every output of a confirmed transaction, in
    /// output order.
    fn get_transaction_out_global_indices(
        &self,
        tx_hash: &Hash256,
    ) -> Result<Vec<u32>, NodeError>;

    /// `count` random unlocked outputs per requested amount, for ring
    /// construction.
    fn get_random_outs_by_amounts(
        &self,
        amounts: Vec<Amount>,
        count: u32,
    ) -> Result<Vec<RandomAmountOuts>, NodeError>;

    fn relay_transaction(&self, transaction: &Transaction) -> Result<(), NodeError>;
}
