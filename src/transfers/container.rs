// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Per-account store of incoming outputs and their spends.
//!
//! Outputs move through three logical sets, joined by [`OutputRef`]:
//! unconfirmed, available and spent. Every mutation goes through the single
//! container lock; secondary indexes (spend descriptor, containing
//! transaction, spending transaction, unlock height) are maintained by the
//! insert/remove choke points below and rebuilt wholesale on load.
//!
//! Lock state is never stored. Whether an output is locked, soft locked or
//! unlocked is derived from the current height against its unlock time, term
//! and the configured spendable age.

use bincode::{Decode, Encode};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::{Read, Write};
use std::ops::Bound::{Excluded, Included};

use crate::codec::{self, StreamError};
use crate::crypto::Hash256;
use crate::primitives::{
    Amount, TransactionExtra, TransactionInput, TransactionPrefix,
};
use crate::transfers::types::{
    BlockInfo, OutputRef, SpentDetails, SpentOutput, SpentOutputDescriptor, TransactionSummary,
    TransferDetails, TransferFlags, TransferOutput, TransferState, UNCONFIRMED_GLOBAL_INDEX,
    UNCONFIRMED_HEIGHT,
};

const CONTAINER_STREAM_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    /// Confirmed transaction added below the current height, or a height
    /// argument that does not fit the operation.
    InvalidHeight,
    /// Global output index inconsistent with the confirmation state.
    InvalidGlobalIndex,
    UnknownTransaction,
    DoubleSpend,
    SpendingUnconfirmed,
    Stream(StreamError),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::InvalidHeight => write!(f, "invalid block height"),
            ContainerError::InvalidGlobalIndex => write!(f, "invalid global output index"),
            ContainerError::UnknownTransaction => write!(f, "transaction is not tracked"),
            ContainerError::DoubleSpend => write!(f, "output is already spent"),
            ContainerError::SpendingUnconfirmed => {
                write!(f, "spending an unconfirmed output is not supported")
            }
            ContainerError::Stream(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ContainerError {}

impl From<StreamError> for ContainerError {
    fn from(err: StreamError) -> Self {
        ContainerError::Stream(err)
    }
}

/// One tracked output together with its confirmation and spend state.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct TransferEntry {
    output: TransferOutput,
    block: BlockInfo,
    unlock_time: u64,
    visible: bool,
    spent: Option<SpentDetails>,
}

impl TransferEntry {
    /// Height at which the hard lock (unlock time or multisignature term)
    /// expires, if the output carries one. `None` for unconfirmed outputs and
    /// outputs without a lock.
    fn unlock_height(&self) -> Option<u32> {
        if !self.block.is_confirmed() {
            return None;
        }

        let time_lock = u32::try_from(self.unlock_time).unwrap_or(u32::MAX);
        let term_lock = match self.output.details {
            TransferDetails::Multisignature { term, .. } if term > 0 => {
                self.block.height.saturating_add(term)
            }
            _ => 0,
        };

        let height = time_lock.max(term_lock);
        (height > 0).then_some(height)
    }

    fn state_at(&self, current_height: u32, spendable_age: u32) -> TransferState {
        if self.spent.is_some() {
            return TransferState::Spent;
        }
        if !self.block.is_confirmed() {
            return TransferState::Locked;
        }
        if let Some(height) = self.unlock_height() {
            if height > current_height {
                return TransferState::Locked;
            }
        }
        if self.block.height.saturating_add(spendable_age) > current_height {
            return TransferState::SoftLocked;
        }
        TransferState::Unlocked
    }
}

#[derive(Default)]
struct ContainerState {
    /// Arena of tracked outputs, keyed by their join key.
    entries: HashMap<OutputRef, TransferEntry>,
    /// Spend identity of each visible output. Invisible duplicates are not
    /// indexed and can never be spent.
    by_descriptor: HashMap<SpentOutputDescriptor, OutputRef>,
    /// Outputs a transaction created, by its hash.
    outputs_by_tx: HashMap<Hash256, Vec<OutputRef>>,
    /// Outputs a transaction consumed, by its hash.
    by_spending_tx: HashMap<Hash256, Vec<OutputRef>>,
    transactions: HashMap<Hash256, TransactionSummary>,
    tx_by_height: BTreeMap<u32, Vec<Hash256>>,
    /// Unlock height to the outputs whose hard lock expires there. Jobs
    /// outlive their firing so a detach can find re-locked outputs.
    unlock_jobs: BTreeMap<u32, Vec<OutputRef>>,
    current_height: u32,
}

impl ContainerState {
    fn schedule_unlock_job(&mut self, output_ref: OutputRef, entry: &TransferEntry) {
        if let Some(height) = entry.unlock_height() {
            let bucket = self.unlock_jobs.entry(height).or_default();
            if !bucket.contains(&output_ref) {
                bucket.push(output_ref);
            }
        }
    }

    fn cancel_unlock_job(&mut self, output_ref: &OutputRef, entry: &TransferEntry) {
        if let Some(height) = entry.unlock_height() {
            if let Some(bucket) = self.unlock_jobs.get_mut(&height) {
                bucket.retain(|r| r != output_ref);
                if bucket.is_empty() {
                    self.unlock_jobs.remove(&height);
                }
            }
        }
    }

    fn remove_tx_from_height_index(&mut self, height: u32, hash: &Hash256) {
        if let Some(bucket) = self.tx_by_height.get_mut(&height) {
            bucket.retain(|h| h != hash);
            if bucket.is_empty() {
                self.tx_by_height.remove(&height);
            }
        }
    }

    /// Removes a transaction, its own outputs and its spends. Returns the
    /// hashes of unconfirmed transactions orphaned by the removal (they spent
    /// an output that no longer exists).
    fn delete_transaction(&mut self, hash: &Hash256) -> Vec<Hash256> {
        let mut orphaned = Vec::new();

        if let Some(spent_refs) = self.by_spending_tx.remove(hash) {
            for output_ref in spent_refs {
                if let Some(entry) = self.entries.get_mut(&output_ref) {
                    entry.spent = None;
                }
            }
        }

        if let Some(own_refs) = self.outputs_by_tx.remove(hash) {
            for output_ref in own_refs {
                let Some(entry) = self.entries.remove(&output_ref) else {
                    continue;
                };
                if let Some(descriptor) = entry.output.descriptor() {
                    if self.by_descriptor.get(&descriptor) == Some(&output_ref) {
                        self.by_descriptor.remove(&descriptor);
                    }
                }
                self.cancel_unlock_job(&output_ref, &entry);
                if let Some(spent) = &entry.spent {
                    if !spent.spending_block.is_confirmed() {
                        orphaned.push(spent.spending_transaction_hash);
                    }
                }
            }
        }

        if let Some(summary) = self.transactions.remove(hash) {
            self.remove_tx_from_height_index(summary.block_height, hash);
        }

        orphaned
    }
}

/// Multi-index store of one account's transfers.
pub struct TransfersContainer {
    state: Mutex<ContainerState>,
    spendable_age: u32,
}

impl TransfersContainer {
    #[must_use]
    pub fn new(spendable_age: u32) -> Self {
        Self {
            state: Mutex::new(ContainerState::default()),
            spendable_age,
        }
    }

    #[must_use]
    pub fn spendable_age(&self) -> u32 {
        self.spendable_age
    }

    #[must_use]
    pub fn current_height(&self) -> u32 {
        self.state.lock().current_height
    }

    /// Records a transaction touching this account. `transfers` are the
    /// outputs addressed to the account; inputs are matched against tracked
    /// outputs by spend descriptor. Returns `Ok(false)` when the transaction
    /// is already known or touches nothing tracked here.
    pub fn add_transaction(
        &self,
        block: &BlockInfo,
        tx: &TransactionPrefix,
        tx_hash: &Hash256,
        transfers: Vec<TransferOutput>,
    ) -> Result<bool, ContainerError> {
        let mut state = self.state.lock();

        if state.transactions.contains_key(tx_hash) {
            return Ok(false);
        }
        if block.is_confirmed() && block.height < state.current_height {
            return Err(ContainerError::InvalidHeight);
        }

        // Pre-check both phases so a failed add leaves no partial state.
        for transfer in &transfers {
            let has_global_index = transfer.global_output_index != UNCONFIRMED_GLOBAL_INDEX;
            if block.is_confirmed() != has_global_index {
                return Err(ContainerError::InvalidGlobalIndex);
            }
        }

        let mut consumed: Vec<(u32, OutputRef)> = Vec::new();
        for (index, input) in tx.inputs.iter().enumerate() {
            let descriptor = match input {
                TransactionInput::Key(input) => {
                    SpentOutputDescriptor::KeyImage(input.key_image)
                }
                TransactionInput::Multisignature(input) => SpentOutputDescriptor::AmountIndex {
                    amount: input.amount,
                    global_index: input.output_index,
                },
            };
            let Some(output_ref) = state.by_descriptor.get(&descriptor).copied() else {
                continue;
            };
            let entry = &state.entries[&output_ref];
            if entry.spent.is_some() {
                return Err(ContainerError::DoubleSpend);
            }
            if !entry.block.is_confirmed() {
                return Err(ContainerError::SpendingUnconfirmed);
            }
            consumed.push((index as u32, output_ref));
        }

        for (input_index, output_ref) in &consumed {
            let entry = state
                .entries
                .get_mut(output_ref)
                .ok_or(ContainerError::UnknownTransaction)?;
            entry.spent = Some(SpentDetails {
                spending_block: *block,
                spending_transaction_hash: *tx_hash,
                input_in_transaction: *input_index,
            });
            state
                .by_spending_tx
                .entry(*tx_hash)
                .or_default()
                .push(*output_ref);
        }

        let added = !transfers.is_empty();
        for transfer in transfers {
            let output_ref = OutputRef {
                transaction_hash: *tx_hash,
                output_in_transaction: transfer.output_in_transaction,
            };
            let descriptor = transfer.descriptor();
            let visible = match &descriptor {
                Some(descriptor) => !state.by_descriptor.contains_key(descriptor),
                None => true,
            };
            if !visible {
                warn!(
                    "duplicate spend descriptor in tx {}, output {} tracked invisible",
                    tx_hash, transfer.output_in_transaction
                );
            }

            let entry = TransferEntry {
                output: transfer,
                block: *block,
                unlock_time: tx.unlock_time,
                visible,
                spent: None,
            };
            if visible {
                if let Some(descriptor) = descriptor {
                    state.by_descriptor.insert(descriptor, output_ref);
                }
            }
            if block.is_confirmed() {
                state.schedule_unlock_job(output_ref, &entry);
            }
            state
                .outputs_by_tx
                .entry(*tx_hash)
                .or_default()
                .push(output_ref);
            state.entries.insert(output_ref, entry);
        }

        if block.is_confirmed() {
            state.current_height = block.height;
        }

        if !added && consumed.is_empty() {
            return Ok(false);
        }

        let extra = TransactionExtra::parse(&tx.extra).unwrap_or_default();
        state.transactions.insert(
            *tx_hash,
            TransactionSummary {
                transaction_hash: *tx_hash,
                block_height: block.height,
                timestamp: block.timestamp,
                transaction_index: block.transaction_index,
                unlock_time: tx.unlock_time,
                total_amount_in: tx.input_total_amount(),
                total_amount_out: tx.output_total_amount(),
                extra: tx.extra.clone(),
                payment_id: extra.payment_id(),
            },
        );
        state
            .tx_by_height
            .entry(block.height)
            .or_default()
            .push(*tx_hash);

        debug!("tracked tx {} at height {}", tx_hash, block.height);
        Ok(true)
    }

    /// Promotes a known unconfirmed transaction to `block`. `global_indices`
    /// holds the global output index of every output of the transaction, in
    /// output order.
    pub fn mark_transaction_confirmed(
        &self,
        block: &BlockInfo,
        tx_hash: &Hash256,
        global_indices: &[u32],
    ) -> Result<(), ContainerError> {
        if !block.is_confirmed() {
            return Err(ContainerError::InvalidHeight);
        }

        let mut state = self.state.lock();

        let summary = state
            .transactions
            .get(tx_hash)
            .ok_or(ContainerError::UnknownTransaction)?;
        if summary.block_height != UNCONFIRMED_HEIGHT {
            return Err(ContainerError::UnknownTransaction);
        }

        let own_refs = state.outputs_by_tx.get(tx_hash).cloned().unwrap_or_default();
        for output_ref in &own_refs {
            let entry = &state.entries[output_ref];
            let index = entry.output.output_in_transaction as usize;
            if index >= global_indices.len() {
                return Err(ContainerError::InvalidGlobalIndex);
            }
        }

        let summary = state
            .transactions
            .get_mut(tx_hash)
            .ok_or(ContainerError::UnknownTransaction)?;
        summary.block_height = block.height;
        summary.timestamp = block.timestamp;
        summary.transaction_index = block.transaction_index;
        state.remove_tx_from_height_index(UNCONFIRMED_HEIGHT, tx_hash);
        state
            .tx_by_height
            .entry(block.height)
            .or_default()
            .push(*tx_hash);

        for output_ref in own_refs {
            let Some(mut entry) = state.entries.remove(&output_ref) else {
                continue;
            };
            entry.block = *block;
            entry.output.global_output_index =
                global_indices[entry.output.output_in_transaction as usize];

            // A multisignature output gains its spend identity only now.
            if let Some(descriptor) = entry.output.descriptor() {
                if entry.visible && !entry.output.is_key() {
                    if state.by_descriptor.contains_key(&descriptor) {
                        entry.visible = false;
                        warn!(
                            "descriptor collision while confirming tx {}, output {}",
                            tx_hash, entry.output.output_in_transaction
                        );
                    } else {
                        state.by_descriptor.insert(descriptor, output_ref);
                    }
                }
            }
            state.schedule_unlock_job(output_ref, &entry);
            state.entries.insert(output_ref, entry);
        }

        if let Some(spent_refs) = state.by_spending_tx.get(tx_hash).cloned() {
            for output_ref in spent_refs {
                if let Some(entry) = state.entries.get_mut(&output_ref) {
                    if let Some(spent) = &mut entry.spent {
                        spent.spending_block = *block;
                    }
                }
            }
        }

        state.current_height = state.current_height.max(block.height);
        debug!("confirmed tx {} at height {}", tx_hash, block.height);
        Ok(())
    }

    /// Drops an unconfirmed transaction: its own outputs disappear and the
    /// outputs it spent become available again. Confirmed data is untouched.
    pub fn delete_unconfirmed_transaction(&self, tx_hash: &Hash256) -> Result<(), ContainerError> {
        let mut state = self.state.lock();

        let summary = state
            .transactions
            .get(tx_hash)
            .ok_or(ContainerError::UnknownTransaction)?;
        if summary.block_height != UNCONFIRMED_HEIGHT {
            return Err(ContainerError::UnknownTransaction);
        }

        state.delete_transaction(tx_hash);
        debug!("deleted unconfirmed tx {}", tx_hash);
        Ok(())
    }

    /// Rolls the container back below `height`. Every transaction confirmed
    /// at `height` or above is removed together with its outputs; spends it
    /// made are reverted; unconfirmed transactions that spent a removed
    /// output are removed in cascade. Returns the removed transaction hashes
    /// and the surviving outputs whose unlock height is no longer satisfied.
    pub fn detach(&self, height: u32) -> (Vec<Hash256>, Vec<TransferOutput>) {
        let mut state = self.state.lock();
        let old_height = state.current_height;

        let mut queue: VecDeque<Hash256> = state
            .tx_by_height
            .range(height..)
            .filter(|(h, _)| **h != UNCONFIRMED_HEIGHT)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect();
        let mut seen: HashSet<Hash256> = queue.iter().copied().collect();
        let mut deleted = Vec::new();

        while let Some(hash) = queue.pop_front() {
            for orphan in state.delete_transaction(&hash) {
                if seen.insert(orphan) {
                    queue.push_back(orphan);
                }
            }
            deleted.push(hash);
        }

        if height < state.current_height {
            state.current_height = height;
        }

        let mut locked = Vec::new();
        for (_, refs) in state
            .unlock_jobs
            .range((Excluded(state.current_height), Included(old_height)))
        {
            for output_ref in refs {
                if let Some(entry) = state.entries.get(output_ref) {
                    if entry.visible && entry.spent.is_none() && entry.block.is_confirmed() {
                        locked.push(entry.output.clone());
                    }
                }
            }
        }

        info!(
            "detached to height {}: {} transactions removed, {} transfers re-locked",
            height,
            deleted.len(),
            locked.len()
        );
        (deleted, locked)
    }

    /// Advances the current height and reports visible outputs whose hard
    /// lock expired in `(current, height]`. Each unlock is reported exactly
    /// once because the height is monotone between detaches.
    pub fn advance_height(&self, height: u32) -> Vec<TransferOutput> {
        let mut state = self.state.lock();
        if height <= state.current_height {
            return Vec::new();
        }

        let mut unlocked = Vec::new();
        for (_, refs) in state
            .unlock_jobs
            .range((Excluded(state.current_height), Included(height)))
        {
            for output_ref in refs {
                if let Some(entry) = state.entries.get(output_ref) {
                    if entry.visible && entry.spent.is_none() && entry.block.is_confirmed() {
                        unlocked.push(entry.output.clone());
                    }
                }
            }
        }

        state.current_height = height;
        unlocked
    }

    // ---- queries ----

    pub fn balance(&self, flags: TransferFlags) -> Amount {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| self.is_included(&state, entry, flags))
            .map(|entry| entry.output.amount)
            .sum()
    }

    pub fn get_outputs(&self, flags: TransferFlags) -> Vec<TransferOutput> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| self.is_included(&state, entry, flags))
            .map(|entry| entry.output.clone())
            .collect()
    }

    /// Outputs created by the given transaction, filtered by `flags`.
    pub fn get_transaction_outputs(
        &self,
        tx_hash: &Hash256,
        flags: TransferFlags,
    ) -> Vec<TransferOutput> {
        let state = self.state.lock();
        let Some(refs) = state.outputs_by_tx.get(tx_hash) else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|r| state.entries.get(r))
            .filter(|entry| self.is_included(&state, entry, flags))
            .map(|entry| entry.output.clone())
            .collect()
    }

    /// Tracked outputs the given transaction consumed, filtered by type.
    pub fn get_transaction_inputs(
        &self,
        tx_hash: &Hash256,
        flags: TransferFlags,
    ) -> Vec<TransferOutput> {
        let state = self.state.lock();
        let Some(refs) = state.by_spending_tx.get(tx_hash) else {
            return Vec::new();
        };
        refs.iter()
            .filter_map(|r| state.entries.get(r))
            .filter(|entry| flags.includes_type(&entry.output))
            .map(|entry| entry.output.clone())
            .collect()
    }

    pub fn get_transfer(
        &self,
        tx_hash: &Hash256,
        output_in_transaction: u32,
    ) -> Option<(TransferOutput, TransferState)> {
        let state = self.state.lock();
        let entry = state.entries.get(&OutputRef {
            transaction_hash: *tx_hash,
            output_in_transaction,
        })?;
        Some((
            entry.output.clone(),
            entry.state_at(state.current_height, self.spendable_age),
        ))
    }

    pub fn get_transaction_information(&self, tx_hash: &Hash256) -> Option<TransactionSummary> {
        self.state.lock().transactions.get(tx_hash).cloned()
    }

    pub fn get_unconfirmed_transactions(&self) -> Vec<Hash256> {
        let state = self.state.lock();
        state
            .tx_by_height
            .get(&UNCONFIRMED_HEIGHT)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_spent_outputs(&self) -> Vec<SpentOutput> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter_map(|(output_ref, entry)| {
                entry.spent.as_ref().map(|spent| SpentOutput {
                    output: entry.output.clone(),
                    transaction_hash: output_ref.transaction_hash,
                    spent: *spent,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn transfers_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn transactions_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn is_included(
        &self,
        state: &ContainerState,
        entry: &TransferEntry,
        flags: TransferFlags,
    ) -> bool {
        entry.visible
            && flags.includes_type(&entry.output)
            && flags.includes_state(entry.state_at(state.current_height, self.spendable_age))
    }

    // ---- persistence ----

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), ContainerError> {
        let state = self.state.lock();
        codec::write_header(writer, CONTAINER_STREAM_VERSION)
            .map_err(|_| StreamError::Truncated)?;

        let entries: Vec<(OutputRef, TransferEntry)> = state
            .entries
            .iter()
            .map(|(r, e)| (*r, e.clone()))
            .collect();
        let transactions: Vec<TransactionSummary> =
            state.transactions.values().cloned().collect();

        codec::encode_into(writer, &(state.current_height, transactions, entries))
            .map_err(|_| StreamError::Truncated)?;
        Ok(())
    }

    /// Replaces the container contents from a stream written by `save`.
    /// Secondary indexes are rebuilt; nothing is kept from a failed load.
    pub fn load<R: Read>(&self, reader: &mut R) -> Result<(), ContainerError> {
        codec::read_header(reader, CONTAINER_STREAM_VERSION)?;

        let (current_height, transactions, entries): (
            u32,
            Vec<TransactionSummary>,
            Vec<(OutputRef, TransferEntry)>,
        ) = codec::decode_from(reader).map_err(|_| StreamError::Truncated)?;

        let mut state = ContainerState {
            current_height,
            ..ContainerState::default()
        };

        for summary in transactions {
            state
                .tx_by_height
                .entry(summary.block_height)
                .or_default()
                .push(summary.transaction_hash);
            state
                .transactions
                .insert(summary.transaction_hash, summary);
        }

        for (output_ref, entry) in entries {
            if entry.visible {
                if let Some(descriptor) = entry.output.descriptor() {
                    state.by_descriptor.insert(descriptor, output_ref);
                }
            }
            if let Some(spent) = &entry.spent {
                state
                    .by_spending_tx
                    .entry(spent.spending_transaction_hash)
                    .or_default()
                    .push(output_ref);
            }
            if entry.block.is_confirmed() {
                state.schedule_unlock_job(output_ref, &entry);
            }
            state
                .outputs_by_tx
                .entry(output_ref.transaction_hash)
                .or_default()
                .push(output_ref);
            state.entries.insert(output_ref, entry);
        }

        *self.state.lock() = state;
        Ok(())
    }
}
