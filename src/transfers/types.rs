// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Record types shared by the transfers container and its consumers.

use bincode::{Decode, Encode};
use bitflags::bitflags;

use crate::crypto::{Hash256, KeyImage, PublicKey};
use crate::primitives::Amount;

/// Block height of transactions that only exist in the pool.
pub const UNCONFIRMED_HEIGHT: u32 = u32::MAX;

/// Global output index of outputs whose confirming block is not known yet.
pub const UNCONFIRMED_GLOBAL_INDEX: u32 = u32::MAX;

/// Position of a transaction within the chain. `height` is
/// [`UNCONFIRMED_HEIGHT`] for pool transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct BlockInfo {
    pub height: u32,
    pub timestamp: u64,
    pub transaction_index: u32,
}

impl BlockInfo {
    #[must_use]
    pub fn unconfirmed() -> Self {
        Self {
            height: UNCONFIRMED_HEIGHT,
            timestamp: 0,
            transaction_index: 0,
        }
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.height != UNCONFIRMED_HEIGHT
    }
}

/// Identity under which an output is spent. Key outputs are identified by
/// their key image; multisignature outputs by their on-chain position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum SpentOutputDescriptor {
    KeyImage(KeyImage),
    AmountIndex { amount: Amount, global_index: u32 },
}

/// Spend tracking data specific to the output target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TransferDetails {
    Key {
        output_key: PublicKey,
        key_image: KeyImage,
    },
    Multisignature {
        required_signatures: u8,
        term: u32,
    },
}

/// One output addressed to a tracked account, as produced by the scan.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransferOutput {
    pub amount: Amount,
    /// [`UNCONFIRMED_GLOBAL_INDEX`] until the output's block is known.
    pub global_output_index: u32,
    pub output_in_transaction: u32,
    pub transaction_public_key: PublicKey,
    pub details: TransferDetails,
}

impl TransferOutput {
    /// Spend identity, if it can be determined yet. Multisignature outputs
    /// have no identity before their global index is known.
    #[must_use]
    pub fn descriptor(&self) -> Option<SpentOutputDescriptor> {
        match self.details {
            TransferDetails::Key { key_image, .. } => {
                Some(SpentOutputDescriptor::KeyImage(key_image))
            }
            TransferDetails::Multisignature { .. } => {
                if self.global_output_index == UNCONFIRMED_GLOBAL_INDEX {
                    None
                } else {
                    Some(SpentOutputDescriptor::AmountIndex {
                        amount: self.amount,
                        global_index: self.global_output_index,
                    })
                }
            }
        }
    }

    #[must_use]
    pub fn is_key(&self) -> bool {
        matches!(self.details, TransferDetails::Key { .. })
    }
}

/// Join key of the container's sets. An output lives in at most one of
/// {unconfirmed, available, spent} under this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct OutputRef {
    pub transaction_hash: Hash256,
    pub output_in_transaction: u32,
}

/// Where and by whom a tracked output was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SpentDetails {
    pub spending_block: BlockInfo,
    pub spending_transaction_hash: Hash256,
    pub input_in_transaction: u32,
}

/// Public view of a spent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub output: TransferOutput,
    pub transaction_hash: Hash256,
    pub spent: SpentDetails,
}

/// Lifecycle state of a tracked output at the container's current height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Locked,
    SoftLocked,
    Unlocked,
    Spent,
}

/// Per-transaction record kept for every transaction that touched the
/// account.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransactionSummary {
    pub transaction_hash: Hash256,
    pub block_height: u32,
    pub timestamp: u64,
    pub transaction_index: u32,
    pub unlock_time: u64,
    pub total_amount_in: Amount,
    pub total_amount_out: Amount,
    pub extra: Vec<u8>,
    pub payment_id: Option<Hash256>,
}

bitflags! {
    /// Type and state masks for balance and output queries.
    pub struct TransferFlags: u32 {
        const STATE_LOCKED = 0x01;
        const STATE_UNLOCKED = 0x02;
        const STATE_SOFT_LOCKED = 0x04;
        const STATE_SPENT = 0x08;
        const STATE_ALL = 0x0f;

        const TYPE_KEY = 0x100;
        const TYPE_MULTISIGNATURE = 0x200;
        const TYPE_ALL = 0x300;

        /// Everything currently spendable.
        const ALL_UNLOCKED = Self::TYPE_ALL.bits | Self::STATE_UNLOCKED.bits;
        /// Everything waiting on confirmations or an unlock height.
        const ALL_LOCKED = Self::TYPE_ALL.bits
            | Self::STATE_LOCKED.bits
            | Self::STATE_SOFT_LOCKED.bits;
        /// Every unspent output of every type.
        const ALL = Self::TYPE_ALL.bits
            | Self::STATE_LOCKED.bits
            | Self::STATE_SOFT_LOCKED.bits
            | Self::STATE_UNLOCKED.bits;
    }
}

impl TransferFlags {
    #[must_use]
    pub fn includes_state(&self, state: TransferState) -> bool {
        match state {
            TransferState::Locked => self.contains(TransferFlags::STATE_LOCKED),
            TransferState::SoftLocked => self.contains(TransferFlags::STATE_SOFT_LOCKED),
            TransferState::Unlocked => self.contains(TransferFlags::STATE_UNLOCKED),
            TransferState::Spent => self.contains(TransferFlags::STATE_SPENT),
        }
    }

    #[must_use]
    pub fn includes_type(&self, output: &TransferOutput) -> bool {
        if output.is_key() {
            self.contains(TransferFlags::TYPE_KEY)
        } else {
            self.contains(TransferFlags::TYPE_MULTISIGNATURE)
        }
    }
}
