// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! View-key scanning consumer. One consumer serves every subscription that
//! shares a view key; each subscription wraps the transfers container of one
//! spend key.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::crypto::{
    generate_key_derivation, generate_key_image_helper, derive_public_key, secret_to_public,
    AccountKeys, AccountPublicAddress, Hash256, PublicKey, SecretKey,
};
use crate::primitives::{TransactionExtra, TransactionOutputTarget};
use crate::sync::{
    BlockEntry, BlockchainConsumer, NodeBackend, ObserverList, SyncError, SyncStart,
    TransactionEntry,
};
use crate::transfers::container::{ContainerError, TransfersContainer};
use crate::transfers::types::{
    BlockInfo, TransferDetails, TransferOutput, UNCONFIRMED_GLOBAL_INDEX, UNCONFIRMED_HEIGHT,
};

/// Registration request for one spend key under a view key.
#[derive(Debug, Clone, Copy)]
pub struct AccountSubscription {
    pub keys: AccountKeys,
    pub sync_start: SyncStart,
    /// Confirmations before an output counts as spendable.
    pub transaction_spendable_age: u32,
}

pub trait TransfersObserver: Send + Sync {
    fn on_transaction_updated(&self, _tx_hash: &Hash256) {}
    fn on_transaction_deleted(&self, _tx_hash: &Hash256) {}
    fn on_error(&self, _error: &SyncError) {}
}

/// One tracked account: its container plus the observers interested in it.
pub struct TransfersSubscription {
    keys: AccountKeys,
    sync_start: SyncStart,
    container: TransfersContainer,
    observers: ObserverList<dyn TransfersObserver>,
}

impl TransfersSubscription {
    fn new(subscription: AccountSubscription) -> Self {
        Self {
            keys: subscription.keys,
            sync_start: subscription.sync_start,
            container: TransfersContainer::new(subscription.transaction_spendable_age),
            observers: ObserverList::new(),
        }
    }

    #[must_use]
    pub fn address(&self) -> AccountPublicAddress {
        self.keys.address
    }

    #[must_use]
    pub fn keys(&self) -> &AccountKeys {
        &self.keys
    }

    #[must_use]
    pub fn sync_start(&self) -> SyncStart {
        self.sync_start
    }

    #[must_use]
    pub fn container(&self) -> &TransfersContainer {
        &self.container
    }

    pub fn add_observer(&self, observer: Arc<dyn TransfersObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn TransfersObserver>) -> bool {
        self.observers.remove(observer)
    }

    fn transaction_updated(&self, tx_hash: &Hash256) {
        self.observers.notify(|o| o.on_transaction_updated(tx_hash));
    }

    fn transaction_deleted(&self, tx_hash: &Hash256) {
        self.observers.notify(|o| o.on_transaction_deleted(tx_hash));
    }

    fn error(&self, error: &SyncError) {
        self.observers.notify(|o| o.on_error(error));
    }
}

/// Scans chain and pool transactions with one view key and feeds every
/// matching output into the right subscription's container.
pub struct TransfersConsumer {
    node: Arc<dyn NodeBackend>,
    view_public_key: PublicKey,
    view_secret_key: SecretKey,
    subscriptions: Mutex<HashMap<PublicKey, Arc<TransfersSubscription>>>,
    /// Pool transactions currently tracked by at least one subscription.
    pool_txs: Mutex<HashSet<Hash256>>,
}

impl TransfersConsumer {
    #[must_use]
    pub fn new(
        node: Arc<dyn NodeBackend>,
        view_public_key: PublicKey,
        view_secret_key: SecretKey,
    ) -> Self {
        Self {
            node,
            view_public_key,
            view_secret_key,
            subscriptions: Mutex::new(HashMap::new()),
            pool_txs: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn view_public_key(&self) -> PublicKey {
        self.view_public_key
    }

    pub fn add_subscription(
        &self,
        subscription: AccountSubscription,
    ) -> Result<Arc<TransfersSubscription>, SyncError> {
        let keys = &subscription.keys;
        if keys.address.view_public_key != self.view_public_key {
            return Err(SyncError::Internal("subscription view key mismatch"));
        }
        if secret_to_public(&keys.view_secret_key) != keys.address.view_public_key
            || secret_to_public(&keys.spend_secret_key) != keys.address.spend_public_key
        {
            return Err(SyncError::Internal("corrupted account keys"));
        }

        let mut subscriptions = self.subscriptions.lock();
        let entry = subscriptions
            .entry(keys.address.spend_public_key)
            .or_insert_with(|| Arc::new(TransfersSubscription::new(subscription)));
        Ok(entry.clone())
    }

    /// Returns whether a subscription was removed.
    pub fn remove_subscription(&self, spend_public_key: &PublicKey) -> bool {
        self.subscriptions.lock().remove(spend_public_key).is_some()
    }

    pub fn get_subscription(
        &self,
        spend_public_key: &PublicKey,
    ) -> Option<Arc<TransfersSubscription>> {
        self.subscriptions.lock().get(spend_public_key).cloned()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    fn subscription_snapshot(&self) -> Vec<(PublicKey, Arc<TransfersSubscription>)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Matches a transaction's outputs against every subscription. Returns
    /// per-spend-key transfers with the global index left unconfirmed.
    fn scan_outputs(
        &self,
        tx: &TransactionEntry,
    ) -> HashMap<PublicKey, Vec<TransferOutput>> {
        let mut found: HashMap<PublicKey, Vec<TransferOutput>> = HashMap::new();

        let Ok(extra) = TransactionExtra::parse(&tx.prefix.extra) else {
            debug!("tx {} carries unparsable extra, outputs skipped", tx.hash);
            return found;
        };
        let Some(tx_public_key) = extra.public_key() else {
            return found;
        };
        let Ok(derivation) = generate_key_derivation(&tx_public_key, &self.view_secret_key)
        else {
            warn!("tx {} carries an invalid public key", tx.hash);
            return found;
        };

        for (spend_public_key, subscription) in self.subscription_snapshot() {
            for (index, output) in tx.prefix.outputs.iter().enumerate() {
                let Ok(expected) =
                    derive_public_key(&derivation, index as u64, &spend_public_key)
                else {
                    continue;
                };

                let details = match &output.target {
                    TransactionOutputTarget::Key(target) if target.key == expected => {
                        match generate_key_image_helper(
                            subscription.keys(),
                            &tx_public_key,
                            index as u64,
                        ) {
                            Ok((_, key_image)) => TransferDetails::Key {
                                output_key: target.key,
                                key_image,
                            },
                            Err(err) => {
                                warn!(
                                    "key image derivation failed for tx {} output {}: {}",
                                    tx.hash, index, err
                                );
                                continue;
                            }
                        }
                    }
                    TransactionOutputTarget::Multisignature(target)
                        if target.keys.contains(&expected) =>
                    {
                        TransferDetails::Multisignature {
                            required_signatures: target.required_signature_count,
                            term: target.term,
                        }
                    }
                    _ => continue,
                };

                found
                    .entry(spend_public_key)
                    .or_default()
                    .push(TransferOutput {
                        amount: output.amount,
                        global_output_index: UNCONFIRMED_GLOBAL_INDEX,
                        output_in_transaction: index as u32,
                        transaction_public_key: tx_public_key,
                        details,
                    });
            }
        }

        found
    }

    fn process_transaction(
        &self,
        block: &BlockInfo,
        tx: &TransactionEntry,
    ) -> Result<(), SyncError> {
        let mut matches = self.scan_outputs(tx);

        // One round trip per matching confirmed transaction.
        let global_indices = if block.is_confirmed() && !matches.is_empty() {
            self.node
                .get_transaction_out_global_indices(&tx.hash)
                .map_err(SyncError::Node)?
        } else {
            Vec::new()
        };

        let mut still_in_pool = false;
        for (spend_public_key, subscription) in self.subscription_snapshot() {
            let mut transfers = matches.remove(&spend_public_key).unwrap_or_default();
            if block.is_confirmed() {
                for transfer in &mut transfers {
                    let index = transfer.output_in_transaction as usize;
                    if index >= global_indices.len() {
                        return Err(SyncError::Container(ContainerError::InvalidGlobalIndex));
                    }
                    transfer.global_output_index = global_indices[index];
                }
            }

            if let Some(info) = subscription.container().get_transaction_information(&tx.hash)
            {
                if info.block_height == UNCONFIRMED_HEIGHT && block.is_confirmed() {
                    subscription
                        .container()
                        .mark_transaction_confirmed(block, &tx.hash, &global_indices)
                        .map_err(SyncError::Container)?;
                    subscription.transaction_updated(&tx.hash);
                } else if !block.is_confirmed() {
                    still_in_pool = true;
                }
                continue;
            }

            match subscription
                .container()
                .add_transaction(block, &tx.prefix, &tx.hash, transfers)
            {
                Ok(true) => {
                    subscription.transaction_updated(&tx.hash);
                    if !block.is_confirmed() {
                        still_in_pool = true;
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    let err = SyncError::Container(err);
                    subscription.error(&err);
                    return Err(err);
                }
            }
        }

        let mut pool_txs = self.pool_txs.lock();
        if still_in_pool {
            pool_txs.insert(tx.hash);
        } else if block.is_confirmed() {
            pool_txs.remove(&tx.hash);
        }
        Ok(())
    }

    fn delete_unconfirmed(&self, tx_hash: &Hash256) {
        if !self.pool_txs.lock().remove(tx_hash) {
            return;
        }
        for (_, subscription) in self.subscription_snapshot() {
            match subscription.container().delete_unconfirmed_transaction(tx_hash) {
                Ok(()) => subscription.transaction_deleted(tx_hash),
                Err(ContainerError::UnknownTransaction) => {}
                Err(err) => {
                    warn!("deleting unconfirmed tx {} failed: {}", tx_hash, err);
                    subscription.error(&SyncError::Container(err));
                }
            }
        }
    }
}

impl BlockchainConsumer for TransfersConsumer {
    fn get_sync_start(&self) -> SyncStart {
        let subscriptions = self.subscriptions.lock();
        let mut start = SyncStart {
            height: u32::MAX,
            timestamp: u64::MAX,
        };
        if subscriptions.is_empty() {
            return SyncStart {
                height: 0,
                timestamp: 0,
            };
        }
        for subscription in subscriptions.values() {
            start.height = start.height.min(subscription.sync_start().height);
            start.timestamp = start.timestamp.min(subscription.sync_start().timestamp);
        }
        start
    }

    fn on_blockchain_detach(&self, height: u32) {
        for (_, subscription) in self.subscription_snapshot() {
            let (deleted, _relocked) = subscription.container().detach(height);
            for tx_hash in deleted {
                self.pool_txs.lock().remove(&tx_hash);
                subscription.transaction_deleted(&tx_hash);
            }
        }
    }

    fn on_new_blocks(&self, blocks: &[BlockEntry], start_height: u32) -> Result<(), SyncError> {
        if blocks.is_empty() {
            return Ok(());
        }

        for (offset, block) in blocks.iter().enumerate() {
            let height = start_height + offset as u32;
            for (tx_index, tx) in block.transactions.iter().enumerate() {
                let block_info = BlockInfo {
                    height,
                    timestamp: block.timestamp,
                    transaction_index: tx_index as u32,
                };
                self.process_transaction(&block_info, tx)?;
            }
        }

        // Blocks with nothing for us still age soft locks.
        let top = start_height + blocks.len() as u32 - 1;
        for (_, subscription) in self.subscription_snapshot() {
            subscription.container().advance_height(top);
        }
        Ok(())
    }

    fn get_known_pool_tx_ids(&self) -> Vec<Hash256> {
        self.pool_txs.lock().iter().copied().collect()
    }

    fn on_pool_updated(
        &self,
        added: &[TransactionEntry],
        deleted: &[Hash256],
    ) -> Result<(), SyncError> {
        for tx in added {
            self.process_transaction(&BlockInfo::unconfirmed(), tx)?;
        }
        for tx_hash in deleted {
            self.delete_unconfirmed(tx_hash);
        }
        Ok(())
    }

    fn add_unconfirmed_transaction(&self, tx: &TransactionEntry) -> Result<(), SyncError> {
        self.process_transaction(&BlockInfo::unconfirmed(), tx)
    }

    fn remove_unconfirmed_transaction(&self, tx_hash: &Hash256) {
        self.delete_unconfirmed(tx_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keys;
    use crate::primitives::{Amount, Transaction, TransactionBuilder};
    use crate::sync::{NodeError, PoolDifference, QueryBlocksResult, RandomAmountOuts};
    use crate::transfers::types::TransferFlags;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixtureNode {
        indices: Mutex<HashMap<Hash256, Vec<u32>>>,
    }

    impl FixtureNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                indices: Mutex::new(HashMap::new()),
            })
        }

        fn set_indices(&self, tx_hash: Hash256, indices: Vec<u32>) {
            self.indices.lock().insert(tx_hash, indices);
        }
    }

    impl NodeBackend for FixtureNode {
        fn query_blocks(
            &self,
            _known_ids: Vec<Hash256>,
            _timestamp: u64,
        ) -> Result<QueryBlocksResult, NodeError> {
            Err(NodeError::InternalNodeError)
        }

        fn get_pool_symmetric_difference(
            &self,
            _known_ids: Vec<Hash256>,
            _last_block: Hash256,
        ) -> Result<PoolDifference, NodeError> {
            Err(NodeError::InternalNodeError)
        }

        fn get_transaction_out_global_indices(
            &self,
            tx_hash: &Hash256,
        ) -> Result<Vec<u32>, NodeError> {
            self.indices
                .lock()
                .get(tx_hash)
                .cloned()
                .ok_or(NodeError::NotFound)
        }

        fn get_random_outs_by_amounts(
            &self,
            _amounts: Vec<Amount>,
            _count: u32,
        ) -> Result<Vec<RandomAmountOuts>, NodeError> {
            Ok(Vec::new())
        }

        fn relay_transaction(&self, _transaction: &Transaction) -> Result<(), NodeError> {
            Ok(())
        }
    }

    fn account_with_view(view: &crate::crypto::KeyPair) -> AccountKeys {
        let spend = generate_keys();
        AccountKeys {
            address: AccountPublicAddress {
                spend_public_key: spend.public_key,
                view_public_key: view.public_key,
            },
            spend_secret_key: spend.secret_key,
            view_secret_key: view.secret_key,
        }
    }

    fn consumer_with_account(
        node: Arc<FixtureNode>,
    ) -> (TransfersConsumer, AccountKeys, Arc<TransfersSubscription>) {
        let view = generate_keys();
        let account = account_with_view(&view);
        let consumer = TransfersConsumer::new(node, view.public_key, view.secret_key);
        let subscription = consumer
            .add_subscription(AccountSubscription {
                keys: account,
                sync_start: SyncStart {
                    height: 0,
                    timestamp: 0,
                },
                transaction_spendable_age: 0,
            })
            .unwrap();
        (consumer, account, subscription)
    }

    fn payment_to(account: &AccountKeys, amount: Amount) -> TransactionEntry {
        let mut builder = TransactionBuilder::new();
        builder.add_key_output(amount, &account.address).unwrap();
        TransactionEntry {
            hash: builder.transaction_hash(),
            prefix: builder.into_transaction().prefix,
        }
    }

    fn block_with(txs: Vec<TransactionEntry>, label: &str) -> BlockEntry {
        BlockEntry {
            block_hash: Hash256::hash_from_slice(label.as_bytes()),
            timestamp: 1_650_000_000,
            transactions: txs,
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        updated: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl TransfersObserver for CountingObserver {
        fn on_transaction_updated(&self, _tx_hash: &Hash256) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_transaction_deleted(&self, _tx_hash: &Hash256) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn confirmed_payment_lands_in_the_container() {
        let node = FixtureNode::new();
        let (consumer, account, subscription) = consumer_with_account(node.clone());
        let tx = payment_to(&account, 700);
        node.set_indices(tx.hash, vec![42]);

        consumer
            .on_new_blocks(&[block_with(vec![tx.clone()], "b1")], 1)
            .unwrap();

        assert_eq!(
            subscription.container().balance(TransferFlags::ALL),
            700
        );
        let (output, _) = subscription.container().get_transfer(&tx.hash, 0).unwrap();
        assert_eq!(output.global_output_index, 42);
        // Replaying the block changes nothing.
        consumer
            .on_new_blocks(&[block_with(vec![tx], "b1")], 1)
            .unwrap();
        assert_eq!(subscription.container().transactions_count(), 1);
    }

    #[test]
    fn foreign_payment_is_ignored() {
        let node = FixtureNode::new();
        let (consumer, _account, subscription) = consumer_with_account(node);
        let stranger = account_with_view(&generate_keys());
        let tx = payment_to(&stranger, 700);

        consumer
            .on_new_blocks(&[block_with(vec![tx], "b1")], 1)
            .unwrap();

        assert_eq!(subscription.container().transactions_count(), 0);
        assert!(consumer.get_known_pool_tx_ids().is_empty());
    }

    #[test]
    fn pool_transaction_is_promoted_when_mined() {
        let node = FixtureNode::new();
        let (consumer, account, subscription) = consumer_with_account(node.clone());
        let observer = Arc::new(CountingObserver::default());
        subscription.add_observer(observer.clone());

        let tx = payment_to(&account, 300);
        consumer.on_pool_updated(&[tx.clone()], &[]).unwrap();

        assert_eq!(consumer.get_known_pool_tx_ids(), vec![tx.hash]);
        assert_eq!(
            subscription.container().balance(TransferFlags::ALL_LOCKED),
            300
        );

        node.set_indices(tx.hash, vec![9]);
        consumer
            .on_new_blocks(&[block_with(vec![tx.clone()], "b5")], 5)
            .unwrap();

        assert!(consumer.get_known_pool_tx_ids().is_empty());
        let (output, _) = subscription.container().get_transfer(&tx.hash, 0).unwrap();
        assert_eq!(output.global_output_index, 9);
        assert_eq!(observer.updated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_pool_transaction_is_deleted() {
        let node = FixtureNode::new();
        let (consumer, account, subscription) = consumer_with_account(node);
        let observer = Arc::new(CountingObserver::default());
        subscription.add_observer(observer.clone());

        let tx = payment_to(&account, 300);
        consumer.on_pool_updated(&[tx.clone()], &[]).unwrap();
        consumer.on_pool_updated(&[], &[tx.hash]).unwrap();

        assert_eq!(subscription.container().balance(TransferFlags::ALL), 0);
        assert!(consumer.get_known_pool_tx_ids().is_empty());
        assert_eq!(observer.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outputs_route_to_the_right_subscription() {
        let node = FixtureNode::new();
        let (consumer, _account_a, subscription_a) = consumer_with_account(node.clone());
        let view = crate::crypto::KeyPair {
            public_key: consumer.view_public_key(),
            secret_key: consumer.view_secret_key,
        };
        let account_b = account_with_view(&view);
        let subscription_b = consumer
            .add_subscription(AccountSubscription {
                keys: account_b,
                sync_start: SyncStart {
                    height: 0,
                    timestamp: 0,
                },
                transaction_spendable_age: 0,
            })
            .unwrap();

        let tx = payment_to(&account_b, 500);
        node.set_indices(tx.hash, vec![3]);
        consumer
            .on_new_blocks(&[block_with(vec![tx], "b2")], 2)
            .unwrap();

        assert_eq!(subscription_a.container().balance(TransferFlags::ALL), 0);
        assert_eq!(
            subscription_b.container().balance(TransferFlags::ALL),
            500
        );
    }

    #[test]
    fn spend_of_tracked_output_is_detected() {
        let node = FixtureNode::new();
        let (consumer, account, subscription) = consumer_with_account(node.clone());

        let tx = payment_to(&account, 900);
        node.set_indices(tx.hash, vec![17]);
        consumer
            .on_new_blocks(&[block_with(vec![tx.clone()], "b1")], 1)
            .unwrap();
        assert_eq!(
            subscription.container().balance(TransferFlags::ALL_UNLOCKED),
            900
        );

        // A later transaction spends the tracked output by key image.
        let extra = TransactionExtra::parse(&tx.prefix.extra).unwrap();
        let (_, key_image) =
            generate_key_image_helper(&account, &extra.public_key().unwrap(), 0).unwrap();
        let mut spend = TransactionBuilder::new();
        spend
            .add_key_input(crate::primitives::KeyInput {
                amount: 900,
                output_offsets: vec![17],
                key_image,
            })
            .unwrap();
        let spend_entry = TransactionEntry {
            hash: spend.transaction_hash(),
            prefix: spend.into_transaction().prefix,
        };

        consumer
            .on_new_blocks(&[block_with(vec![spend_entry], "b2")], 2)
            .unwrap();
        assert_eq!(
            subscription.container().balance(TransferFlags::ALL_UNLOCKED),
            0
        );
        assert_eq!(subscription.container().get_spent_outputs().len(), 1);
    }

    #[test]
    fn detach_forwards_to_containers() {
        let node = FixtureNode::new();
        let (consumer, account, subscription) = consumer_with_account(node.clone());
        let observer = Arc::new(CountingObserver::default());
        subscription.add_observer(observer.clone());

        let tx = payment_to(&account, 100);
        node.set_indices(tx.hash, vec![1]);
        consumer
            .on_new_blocks(&[block_with(vec![tx], "b8")], 8)
            .unwrap();

        consumer.on_blockchain_detach(8);
        assert_eq!(subscription.container().transactions_count(), 0);
        assert_eq!(observer.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_rejects_foreign_view_key() {
        let node = FixtureNode::new();
        let (consumer, _, _) = consumer_with_account(node);
        let foreign = account_with_view(&generate_keys());

        assert!(consumer
            .add_subscription(AccountSubscription {
                keys: foreign,
                sync_start: SyncStart {
                    height: 0,
                    timestamp: 0
                },
                transaction_spendable_age: 0,
            })
            .is_err());
    }
}
