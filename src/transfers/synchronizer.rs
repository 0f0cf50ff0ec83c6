// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Front door for transfer tracking. Accounts sharing a view key are folded
//! into one [`TransfersConsumer`], and each consumer is registered with the
//! blockchain synchronizer exactly once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::codec::{self, StreamError};
use crate::crypto::{AccountPublicAddress, PublicKey};
use crate::sync::{BlockchainSynchronizer, ConsumerId, NodeBackend, SyncError};
use crate::transfers::consumer::{
    AccountSubscription, TransfersConsumer, TransfersSubscription,
};

const TRANSFERS_STREAM_VERSION: u8 = 1;

struct ConsumerBinding {
    id: ConsumerId,
    consumer: Arc<TransfersConsumer>,
}

pub struct TransfersSynchronizer {
    node: Arc<dyn NodeBackend>,
    sync: Arc<BlockchainSynchronizer>,
    consumers: Mutex<HashMap<PublicKey, ConsumerBinding>>,
}

impl TransfersSynchronizer {
    #[must_use]
    pub fn new(node: Arc<dyn NodeBackend>, sync: Arc<BlockchainSynchronizer>) -> Self {
        Self {
            node,
            sync,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an account for tracking. The consumer for its view key is
    /// created and hooked into the blockchain synchronizer on first use.
    pub fn add_subscription(
        &self,
        subscription: AccountSubscription,
    ) -> Result<Arc<TransfersSubscription>, SyncError> {
        let view_public_key = subscription.keys.address.view_public_key;
        let mut consumers = self.consumers.lock();

        if let Some(binding) = consumers.get(&view_public_key) {
            return binding.consumer.add_subscription(subscription);
        }

        let consumer = Arc::new(TransfersConsumer::new(
            self.node.clone(),
            view_public_key,
            subscription.keys.view_secret_key,
        ));
        let tracked = consumer.add_subscription(subscription)?;
        let id = self.sync.add_consumer(consumer.clone());
        consumers.insert(view_public_key, ConsumerBinding { id, consumer });
        Ok(tracked)
    }

    /// Drops one account. The consumer is unregistered from the blockchain
    /// synchronizer once its last subscription is gone.
    pub fn remove_subscription(&self, address: &AccountPublicAddress) -> bool {
        let mut consumers = self.consumers.lock();
        let Some(binding) = consumers.get(&address.view_public_key) else {
            return false;
        };
        if !binding.consumer.remove_subscription(&address.spend_public_key) {
            return false;
        }
        if binding.consumer.is_empty() {
            let id = binding.id;
            consumers.remove(&address.view_public_key);
            self.sync.remove_consumer(id);
        }
        true
    }

    pub fn get_subscription(
        &self,
        address: &AccountPublicAddress,
    ) -> Option<Arc<TransfersSubscription>> {
        self.consumers
            .lock()
            .get(&address.view_public_key)?
            .consumer
            .get_subscription(&address.spend_public_key)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Persists the sparse chain history of every consumer, keyed by view
    /// key.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), SyncError> {
        codec::write_header(writer, TRANSFERS_STREAM_VERSION)
            .map_err(|_| StreamError::Truncated)?;

        let consumers = self.consumers.lock();
        let mut states: Vec<(PublicKey, Vec<u8>)> = Vec::with_capacity(consumers.len());
        for (view_public_key, binding) in consumers.iter() {
            let mut buf = Vec::new();
            self.sync.save_consumer_state(binding.id, &mut buf)?;
            states.push((*view_public_key, buf));
        }
        codec::encode_into(writer, &states).map_err(|_| StreamError::Truncated)?;
        Ok(())
    }

    /// Restores consumer histories. Every persisted view key must already
    /// have a live subscription.
    pub fn load<R: Read>(&self, reader: &mut R) -> Result<(), SyncError> {
        codec::read_header(reader, TRANSFERS_STREAM_VERSION)?;
        let states: Vec<(PublicKey, Vec<u8>)> =
            codec::decode_from(reader).map_err(|_| StreamError::Truncated)?;

        let consumers = self.consumers.lock();
        for (view_public_key, state) in states {
            let binding = consumers
                .get(&view_public_key)
                .ok_or(SyncError::UnknownConsumer)?;
            self.sync.load_consumer_state(binding.id, &mut &state[..])?;
        }
        Ok(())
    }
}
