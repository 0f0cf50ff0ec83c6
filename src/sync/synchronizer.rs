// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Pull-based synchronizer between a remote node and registered consumers.
//!
//! A single worker thread runs passes against the node. What runs next is a
//! pair of states behind a mutex: `current_state` is the pass in flight,
//! `future_state` the highest-priority work requested meanwhile. Requests
//! only ever raise the future state; a finished pass decays it through
//! [`SyncState::follow_up`] (blockchain sync implies a pool check, a pool
//! check decays to idle).

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::codec::{self, StreamError};
use crate::crypto::Hash256;
use crate::sync::node::{BlockEntry, NodeBackend, NodeError, TransactionEntry};
use crate::sync::observer::ObserverList;
use crate::sync::state::SynchronizationState;
use crate::transfers::ContainerError;

const SYNC_STREAM_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Node(NodeError),
    Container(ContainerError),
    Stream(StreamError),
    /// The task was dropped because the synchronizer stopped.
    Cancelled,
    AlreadyStarted,
    NotStarted,
    GenesisMismatch,
    UnknownConsumer,
    Internal(&'static str),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Node(err) => write!(f, "node: {err}"),
            SyncError::Container(err) => write!(f, "container: {err}"),
            SyncError::Stream(err) => write!(f, "stream: {err}"),
            SyncError::Cancelled => write!(f, "operation cancelled"),
            SyncError::AlreadyStarted => write!(f, "synchronizer already started"),
            SyncError::NotStarted => write!(f, "synchronizer is not running"),
            SyncError::GenesisMismatch => write!(f, "genesis block hash mismatch"),
            SyncError::UnknownConsumer => write!(f, "consumer is not registered"),
            SyncError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<NodeError> for SyncError {
    fn from(err: NodeError) -> Self {
        SyncError::Node(err)
    }
}

impl From<ContainerError> for SyncError {
    fn from(err: ContainerError) -> Self {
        SyncError::Container(err)
    }
}

impl From<StreamError> for SyncError {
    fn from(err: StreamError) -> Self {
        SyncError::Stream(err)
    }
}

/// Where a consumer wants synchronization to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStart {
    pub height: u32,
    pub timestamp: u64,
}

/// A sink for chain and pool events, driven by [`BlockchainSynchronizer`].
/// All callbacks arrive on the synchronizer's worker thread. `on_new_blocks`
/// and `on_pool_updated` must be idempotent: the same block or pool
/// transaction may be delivered again after a partial failure.
pub trait BlockchainConsumer: Send + Sync {
    fn get_sync_start(&self) -> SyncStart;

    fn on_blockchain_detach(&self, height: u32);

    /// `start_height` is the height of `blocks[0]`.
    fn on_new_blocks(&self, blocks: &[BlockEntry], start_height: u32) -> Result<(), SyncError>;

    fn get_known_pool_tx_ids(&self) -> Vec<Hash256>;

    fn on_pool_updated(
        &self,
        added: &[TransactionEntry],
        deleted: &[Hash256],
    ) -> Result<(), SyncError>;

    fn add_unconfirmed_transaction(&self, tx: &TransactionEntry) -> Result<(), SyncError>;

    fn remove_unconfirmed_transaction(&self, tx_hash: &Hash256);
}

pub trait SyncObserver: Send + Sync {
    fn synchronization_progress_updated(&self, _processed: u32, _total: u32) {}
    fn synchronization_completed(&self, _result: Result<(), SyncError>) {}
}

/// Worker states, ordered by an explicit priority table. A request may only
/// raise the pending state; `Stopped` outranks everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    PoolSync,
    BlockchainSync,
    Stopped,
}

impl SyncState {
    fn priority(self) -> u8 {
        match self {
            SyncState::Idle => 0,
            SyncState::PoolSync => 1,
            SyncState::BlockchainSync => 2,
            SyncState::Stopped => 3,
        }
    }

    fn outranks(self, other: SyncState) -> bool {
        self.priority() > other.priority()
    }

    /// What runs after a pass of `self` unless something outranks it.
    fn follow_up(self) -> SyncState {
        match self {
            SyncState::BlockchainSync => SyncState::PoolSync,
            SyncState::PoolSync => SyncState::Idle,
            SyncState::Idle => SyncState::Idle,
            SyncState::Stopped => SyncState::Stopped,
        }
    }
}

type TaskResult = Result<(), SyncError>;

/// Queued unconfirmed-transaction work. One queue keeps submission order:
/// an add followed by a remove of the same transaction resolves in that
/// order.
enum SyncTask {
    Add(TransactionEntry, Sender<TaskResult>),
    Remove(Hash256, Sender<TaskResult>),
}

impl SyncTask {
    fn cancel(self) {
        match self {
            SyncTask::Add(_, done) | SyncTask::Remove(_, done) => {
                done.send(Err(SyncError::Cancelled)).ok();
            }
        }
    }
}

struct SyncInner {
    current_state: SyncState,
    future_state: SyncState,
    /// True from `start` until the queue drain in `stop`. Guarded by the same
    /// lock as `tasks` so no task can be queued without a worker to answer
    /// it.
    worker_alive: bool,
    tasks: VecDeque<SyncTask>,
}

/// Handle identifying one registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

struct ConsumerEntry {
    id: u64,
    consumer: Arc<dyn BlockchainConsumer>,
    state: SynchronizationState,
}

struct SyncCore {
    node: Arc<dyn NodeBackend>,
    genesis_hash: Hash256,
    inner: Mutex<SyncInner>,
    wake: Condvar,
    /// Registration order preserved; removal mid-pass is tolerated because
    /// passes work on a snapshot and write horizons back by id.
    consumers: Mutex<Vec<ConsumerEntry>>,
    observers: ObserverList<dyn SyncObserver>,
    last_block_id: Mutex<Hash256>,
}

pub struct BlockchainSynchronizer {
    core: Arc<SyncCore>,
    next_consumer_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockchainSynchronizer {
    #[must_use]
    pub fn new(node: Arc<dyn NodeBackend>, genesis_hash: Hash256) -> Self {
        Self {
            core: Arc::new(SyncCore {
                node,
                genesis_hash,
                inner: Mutex::new(SyncInner {
                    current_state: SyncState::Idle,
                    future_state: SyncState::Idle,
                    worker_alive: false,
                    tasks: VecDeque::new(),
                }),
                wake: Condvar::new(),
                consumers: Mutex::new(Vec::new()),
                observers: ObserverList::new(),
                last_block_id: Mutex::new(genesis_hash),
            }),
            next_consumer_id: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn add_consumer(&self, consumer: Arc<dyn BlockchainConsumer>) -> ConsumerId {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.core.consumers.lock().push(ConsumerEntry {
            id,
            consumer,
            state: SynchronizationState::new(self.core.genesis_hash),
        });
        ConsumerId(id)
    }

    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut consumers = self.core.consumers.lock();
        let before = consumers.len();
        consumers.retain(|entry| entry.id != id.0);
        consumers.len() != before
    }

    /// Known block count of a consumer, genesis included.
    pub fn consumer_horizon(&self, id: ConsumerId) -> Option<usize> {
        self.core
            .consumers
            .lock()
            .iter()
            .find(|entry| entry.id == id.0)
            .map(|entry| entry.state.known_block_count())
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.core.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn SyncObserver>) -> bool {
        self.core.observers.remove(observer)
    }

    pub fn start(&self) -> Result<(), SyncError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        {
            let mut inner = self.core.inner.lock();
            inner.current_state = SyncState::Idle;
            inner.future_state = SyncState::BlockchainSync;
            inner.worker_alive = true;
        }

        let core = self.core.clone();
        let handle = thread::Builder::new()
            .name("blockchain-sync".into())
            .spawn(move || core.worker_loop())
            .map_err(|_| {
                self.core.inner.lock().worker_alive = false;
                SyncError::Internal("failed to spawn sync worker")
            })?;
        *worker = Some(handle);
        info!("blockchain synchronizer started");
        Ok(())
    }

    /// Stops the worker. The pass in flight finishes; queued tasks are
    /// answered [`SyncError::Cancelled`]. The synchronizer can be started
    /// again afterwards.
    pub fn stop(&self) {
        self.core.set_future_state(SyncState::Stopped);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.join().ok();
            info!("blockchain synchronizer stopped");
        }

        // Tasks that raced past the worker's final drain are answered here,
        // under the same lock that gates new submissions.
        let leftovers = {
            let mut inner = self.core.inner.lock();
            inner.current_state = SyncState::Idle;
            inner.future_state = SyncState::Idle;
            inner.worker_alive = false;
            inner.tasks.drain(..).collect::<Vec<SyncTask>>()
        };
        for task in leftovers {
            task.cancel();
        }
    }

    // ---- node event entry points ----

    pub fn local_blockchain_updated(&self, height: u32) {
        debug!("local blockchain updated to height {}", height);
        self.core.set_future_state(SyncState::BlockchainSync);
    }

    pub fn last_known_block_height_updated(&self, height: u32) {
        debug!("last known block height updated to {}", height);
        self.core.set_future_state(SyncState::BlockchainSync);
    }

    pub fn pool_changed(&self) {
        self.core.set_future_state(SyncState::PoolSync);
    }

    // ---- unconfirmed transaction tasks ----

    /// Queues the transaction for delivery to every consumer. The returned
    /// receiver yields once: success, the first consumer failure (with the
    /// delivery rolled back), or [`SyncError::Cancelled`].
    pub fn add_unconfirmed_transaction(
        &self,
        tx: TransactionEntry,
    ) -> Receiver<Result<(), SyncError>> {
        self.enqueue_task(|sender| SyncTask::Add(tx, sender))
    }

    pub fn remove_unconfirmed_transaction(
        &self,
        tx_hash: Hash256,
    ) -> Receiver<Result<(), SyncError>> {
        self.enqueue_task(|sender| SyncTask::Remove(tx_hash, sender))
    }

    fn enqueue_task(
        &self,
        task: impl FnOnce(Sender<TaskResult>) -> SyncTask,
    ) -> Receiver<Result<(), SyncError>> {
        let (sender, receiver) = bounded(1);

        let mut inner = self.core.inner.lock();
        if !inner.worker_alive {
            drop(inner);
            sender.send(Err(SyncError::NotStarted)).ok();
            return receiver;
        }
        if inner.future_state == SyncState::Stopped {
            drop(inner);
            sender.send(Err(SyncError::Cancelled)).ok();
            return receiver;
        }
        inner.tasks.push_back(task(sender));
        drop(inner);
        self.core.wake.notify_all();
        receiver
    }

    // ---- persistence ----

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), SyncError> {
        codec::write_header(writer, SYNC_STREAM_VERSION)
            .map_err(|_| StreamError::Truncated)?;
        let last_block_id = *self.core.last_block_id.lock();
        codec::encode_into(writer, &(self.core.genesis_hash, last_block_id))
            .map_err(|_| StreamError::Truncated)?;
        Ok(())
    }

    pub fn load<R: Read>(&self, reader: &mut R) -> Result<(), SyncError> {
        codec::read_header(reader, SYNC_STREAM_VERSION)?;
        let (genesis_hash, last_block_id): (Hash256, Hash256) =
            codec::decode_from(reader).map_err(|_| StreamError::Truncated)?;
        if genesis_hash != self.core.genesis_hash {
            return Err(SyncError::GenesisMismatch);
        }
        *self.core.last_block_id.lock() = last_block_id;
        Ok(())
    }

    pub fn save_consumer_state<W: Write>(
        &self,
        id: ConsumerId,
        writer: &mut W,
    ) -> Result<(), SyncError> {
        let consumers = self.core.consumers.lock();
        let entry = consumers
            .iter()
            .find(|entry| entry.id == id.0)
            .ok_or(SyncError::UnknownConsumer)?;
        entry.state.save(writer)?;
        Ok(())
    }

    pub fn load_consumer_state<R: Read>(
        &self,
        id: ConsumerId,
        reader: &mut R,
    ) -> Result<(), SyncError> {
        let state = SynchronizationState::load(reader)?;
        if state.genesis_hash() != self.core.genesis_hash {
            return Err(SyncError::GenesisMismatch);
        }
        let mut consumers = self.core.consumers.lock();
        let entry = consumers
            .iter_mut()
            .find(|entry| entry.id == id.0)
            .ok_or(SyncError::UnknownConsumer)?;
        entry.state = state;
        Ok(())
    }
}

impl Drop for BlockchainSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SyncCore {
    /// Raises the pending state. Lower- or equal-priority requests are
    /// already covered by what is pending and are ignored.
    fn set_future_state(&self, state: SyncState) -> bool {
        let mut inner = self.inner.lock();
        if !state.outranks(inner.future_state) {
            return false;
        }
        inner.future_state = state;
        drop(inner);
        self.wake.notify_all();
        true
    }

    fn worker_loop(&self) {
        loop {
            let (state, tasks) = {
                let mut inner = self.inner.lock();
                while inner.future_state == SyncState::Idle && inner.tasks.is_empty() {
                    self.wake.wait(&mut inner);
                }

                let state = inner.future_state;
                inner.current_state = state;
                inner.future_state = state.follow_up();
                let tasks: Vec<SyncTask> = inner.tasks.drain(..).collect();
                (state, tasks)
            };

            if state == SyncState::Stopped {
                for task in tasks {
                    task.cancel();
                }
                return;
            }

            self.process_tasks(tasks);

            match state {
                SyncState::BlockchainSync => self.blockchain_pass(),
                SyncState::PoolSync => self.pool_pass(),
                SyncState::Idle | SyncState::Stopped => {}
            }
        }
    }

    fn consumer_snapshot(&self) -> Vec<(u64, Arc<dyn BlockchainConsumer>, SynchronizationState)> {
        self.consumers
            .lock()
            .iter()
            .map(|entry| (entry.id, entry.consumer.clone(), entry.state.clone()))
            .collect()
    }

    fn process_tasks(&self, tasks: Vec<SyncTask>) {
        for task in tasks {
            match task {
                SyncTask::Remove(tx_hash, done) => {
                    for (_, consumer, _) in self.consumer_snapshot() {
                        consumer.remove_unconfirmed_transaction(&tx_hash);
                    }
                    done.send(Ok(())).ok();
                }
                SyncTask::Add(tx, done) => {
                    let consumers = self.consumer_snapshot();
                    let mut delivered: Vec<Arc<dyn BlockchainConsumer>> = Vec::new();
                    let mut result = Ok(());

                    for (_, consumer, _) in &consumers {
                        match consumer.add_unconfirmed_transaction(&tx) {
                            Ok(()) => delivered.push(consumer.clone()),
                            Err(err) => {
                                warn!("adding unconfirmed tx {} failed: {}", tx.hash, err);
                                result = Err(err);
                                break;
                            }
                        }
                    }

                    if result.is_err() {
                        for consumer in delivered {
                            consumer.remove_unconfirmed_transaction(&tx.hash);
                        }
                    }
                    done.send(result).ok();
                }
            }
        }
    }

    /// One blockchain round trip. The request is driven by the consumer with
    /// the lowest horizon so no registered consumer is starved; horizons move
    /// only for consumers that processed their share successfully.
    fn blockchain_pass(&self) {
        let snapshot = self.consumer_snapshot();
        let Some(lowest) = snapshot
            .iter()
            .min_by_key(|(_, _, state)| state.known_block_count())
        else {
            return;
        };

        let history = lowest.2.short_history();
        let timestamp = snapshot
            .iter()
            .map(|(_, consumer, _)| consumer.get_sync_start().timestamp)
            .min()
            .unwrap_or(0);

        let response = match self.node.query_blocks(history, timestamp) {
            Ok(response) => response,
            Err(err) => {
                warn!("query_blocks failed: {}", err);
                self.observers
                    .notify(|o| o.synchronization_completed(Err(SyncError::Node(err))));
                return;
            }
        };

        let hashes: Vec<Hash256> = response
            .blocks
            .iter()
            .map(|block| block.block_hash)
            .collect();

        let mut any_new = false;
        let mut first_error: Option<SyncError> = None;
        let mut updated: Vec<(u64, SynchronizationState)> = Vec::new();
        let mut top_processed: u32 = 0;

        for (id, consumer, mut state) in snapshot {
            let check = state.check_interval(response.start_height, &hashes);
            if check.detach_required {
                info!("consumer {} detaching at height {}", id, check.detach_height);
                consumer.on_blockchain_detach(check.detach_height);
                state.detach(check.detach_height);
            }
            if check.has_new_blocks {
                // A response whose new blocks do not start exactly at the
                // consumer's horizon never reaches the consumer.
                if check.new_block_height as usize != state.known_block_count() {
                    warn!(
                        "consumer {} offered blocks from height {} past its horizon {}",
                        id,
                        check.new_block_height,
                        state.known_block_count()
                    );
                    first_error.get_or_insert(SyncError::Internal(
                        "block interval does not extend the known chain",
                    ));
                    continue;
                }
                let offset = (check.new_block_height - response.start_height) as usize;
                match consumer.on_new_blocks(&response.blocks[offset..], check.new_block_height) {
                    Ok(()) => {
                        if !state.add_blocks(check.new_block_height, &hashes[offset..]) {
                            first_error.get_or_insert(SyncError::Internal(
                                "block interval does not extend the known chain",
                            ));
                            continue;
                        }
                        any_new = true;
                    }
                    Err(err) => {
                        warn!("consumer {} rejected new blocks: {}", id, err);
                        first_error.get_or_insert(err);
                        // Horizon untouched; the same interval is retried on
                        // the next pass.
                        continue;
                    }
                }
            }
            top_processed = top_processed.max(state.known_block_count() as u32 - 1);
            updated.push((id, state));
        }

        {
            let mut consumers = self.consumers.lock();
            for (id, state) in updated {
                if let Some(entry) = consumers.iter_mut().find(|entry| entry.id == id) {
                    entry.state = state;
                }
            }
        }

        if let Some(last) = hashes.last() {
            *self.last_block_id.lock() = *last;
        }

        if any_new {
            let total = response.start_height + hashes.len() as u32 - 1;
            self.observers
                .notify(|o| o.synchronization_progress_updated(top_processed, total));
        }

        if let Some(err) = first_error {
            self.observers
                .notify(|o| o.synchronization_completed(Err(err.clone())));
        } else if any_new {
            // More may be waiting behind the batch limit.
            self.set_future_state(SyncState::BlockchainSync);
        } else {
            self.observers
                .notify(|o| o.synchronization_completed(Ok(())));
        }
    }

    /// One pool round trip: a single symmetric-difference request over the
    /// union of all consumers' known pool ids, fanned out to every consumer.
    /// Consumers ignore additions and deletions they cannot use.
    fn pool_pass(&self) {
        let snapshot = self.consumer_snapshot();
        if snapshot.is_empty() {
            return;
        }

        let mut known: HashSet<Hash256> = HashSet::new();
        for (_, consumer, _) in &snapshot {
            known.extend(consumer.get_known_pool_tx_ids());
        }
        let known: Vec<Hash256> = known.into_iter().collect();
        let last_block = *self.last_block_id.lock();

        let diff = match self.node.get_pool_symmetric_difference(known, last_block) {
            Ok(diff) => diff,
            Err(err) => {
                warn!("pool difference request failed: {}", err);
                self.observers
                    .notify(|o| o.synchronization_completed(Err(SyncError::Node(err))));
                return;
            }
        };

        if !diff.is_last_known_block_actual {
            // The chain moved under us; resynchronize it before the pool.
            self.set_future_state(SyncState::BlockchainSync);
            return;
        }

        for (id, consumer, _) in snapshot {
            if let Err(err) = consumer.on_pool_updated(&diff.added, &diff.deleted) {
                warn!("consumer {} failed pool update: {}", id, err);
            }
        }
    }
}
