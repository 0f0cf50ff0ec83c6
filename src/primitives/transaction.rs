// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Transaction wire format and the mutable transaction object model:
//! incremental construction, signing and structural validation.

use bincode::{Decode, Encode};
use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;

use crate::crypto::{
    check_ring_signature, check_signature, derive_public_key, derive_secret_key,
    generate_deterministic_transaction_keys, generate_key_derivation, generate_key_image_helper,
    generate_keys, generate_ring_signature, generate_signature, secret_to_public,
    AccountKeys, AccountPublicAddress, Hash256, KeyError, KeyImage, KeyPair, PublicKey, SecretKey,
    Signature,
};
use crate::primitives::extra::{ExtraError, TransactionExtra};

pub type Amount = u64;

pub const TRANSACTION_VERSION_1: u8 = 1;
/// Version 2 marks transactions carrying multisignature inputs or outputs.
pub const TRANSACTION_VERSION_2: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum InputType {
    Key,
    Multisignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum OutputType {
    Key,
    Multisignature,
}

/// Ring input: spends one of the outputs addressed by `output_offsets`.
/// Offsets are relative (delta encoded) global output indices for the input's
/// amount, matching the addressing verifiers use.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct KeyInput {
    pub amount: Amount,
    pub output_offsets: Vec<u32>,
    pub key_image: KeyImage,
}

/// Spends a multisignature output identified by (amount, global index).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MultisignatureInput {
    pub amount: Amount,
    pub signature_count: u8,
    pub output_index: u32,
    pub term: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum TransactionInput {
    Key(KeyInput),
    Multisignature(MultisignatureInput),
}

impl TransactionInput {
    #[must_use]
    pub fn input_type(&self) -> InputType {
        match self {
            TransactionInput::Key(_) => InputType::Key,
            TransactionInput::Multisignature(_) => InputType::Multisignature,
        }
    }

    #[must_use]
    pub fn amount(&self) -> Amount {
        match self {
            TransactionInput::Key(input) => input.amount,
            TransactionInput::Multisignature(input) => input.amount,
        }
    }

    /// Signatures this input needs before [`Transaction::validate_signatures`]
    /// can succeed.
    #[must_use]
    pub fn required_signatures_count(&self) -> usize {
        match self {
            TransactionInput::Key(_) => 1,
            TransactionInput::Multisignature(input) => input.signature_count as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct KeyOutput {
    pub key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MultisignatureOutput {
    pub keys: Vec<PublicKey>,
    pub required_signature_count: u8,
    /// Number of blocks the output stays locked after its confirming height.
    pub term: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum TransactionOutputTarget {
    Key(KeyOutput),
    Multisignature(MultisignatureOutput),
}

impl TransactionOutputTarget {
    #[must_use]
    pub fn output_type(&self) -> OutputType {
        match self {
            TransactionOutputTarget::Key(_) => OutputType::Key,
            TransactionOutputTarget::Multisignature(_) => OutputType::Multisignature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransactionOutput {
    pub amount: Amount,
    pub target: TransactionOutputTarget,
}

/// The signed portion of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_time: u64,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    /// One signature vector per input, in input order.
    pub signatures: Vec<Vec<Signature>>,
}

impl TransactionPrefix {
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_from_slice(crate::codec::encode_to_vec(self).unwrap())
    }

    pub fn inputs_hash(&self) -> Hash256 {
        Hash256::hash_from_slice(crate::codec::encode_to_vec(&self.inputs).unwrap())
    }

    #[must_use]
    pub fn input_total_amount(&self) -> Amount {
        self.inputs.iter().map(TransactionInput::amount).sum()
    }

    #[must_use]
    pub fn output_total_amount(&self) -> Amount {
        self.outputs.iter().map(|out| out.amount).sum()
    }

    /// Structural input checks. Boolean by design so batch validation can
    /// keep checking other aspects after a failure.
    #[must_use]
    pub fn validate_inputs(&self) -> bool {
        let mut sum: Amount = 0;
        let mut key_images: HashSet<KeyImage> = HashSet::new();
        let mut multisig_ids: HashSet<(Amount, u32)> = HashSet::new();

        for input in &self.inputs {
            match sum.checked_add(input.amount()) {
                Some(next) => sum = next,
                None => return false,
            }

            match input {
                TransactionInput::Key(input) => {
                    if input.output_offsets.is_empty() {
                        return false;
                    }
                    // A zero relative offset past the first element means two
                    // ring members collapse onto the same global output.
                    if input.output_offsets[1..].iter().any(|&off| off == 0) {
                        return false;
                    }
                    if !key_images.insert(input.key_image) {
                        return false;
                    }
                }
                TransactionInput::Multisignature(input) => {
                    if input.signature_count == 0 {
                        return false;
                    }
                    if !multisig_ids.insert((input.amount, input.output_index)) {
                        return false;
                    }
                }
            }
        }

        true
    }

    #[must_use]
    pub fn validate_outputs(&self) -> bool {
        let mut sum: Amount = 0;

        for output in &self.outputs {
            if output.amount == 0 {
                return false;
            }
            match sum.checked_add(output.amount) {
                Some(next) => sum = next,
                None => return false,
            }

            if let TransactionOutputTarget::Multisignature(target) = &output.target {
                if target.required_signature_count == 0
                    || target.required_signature_count as usize > target.keys.len()
                {
                    return false;
                }
            }
        }

        true
    }
}

impl Transaction {
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_from_slice(self.to_bytes())
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).unwrap()
    }

    /// Every input must have accumulated at least
    /// [`TransactionInput::required_signatures_count`] signatures.
    #[must_use]
    pub fn validate_signatures(&self) -> bool {
        if self.signatures.len() < self.prefix.inputs.len() {
            return false;
        }

        self.prefix
            .inputs
            .iter()
            .zip(&self.signatures)
            .all(|(input, sigs)| sigs.len() >= input.required_signatures_count())
    }
}

/// Converts absolute global output indices to the delta encoding used on the
/// wire. Indices must be strictly increasing; the transformation preserves
/// the original output ordering.
pub fn absolute_offsets_to_relative(offsets: &[u32]) -> Result<Vec<u32>, TxError> {
    if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(TxError::UnsortedOutputOffsets);
    }

    let mut relative = offsets.to_vec();
    for i in (1..relative.len()).rev() {
        relative[i] -= relative[i - 1];
    }
    Ok(relative)
}

pub fn relative_offsets_to_absolute(offsets: &[u32]) -> Result<Vec<u32>, TxError> {
    let mut absolute = offsets.to_vec();
    for i in 1..absolute.len() {
        absolute[i] = absolute[i - 1]
            .checked_add(absolute[i])
            .ok_or(TxError::UnsortedOutputOffsets)?;
    }
    Ok(absolute)
}

/// A ring member candidate: an on-chain output of the input's amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOutput {
    pub public_key: PublicKey,
    pub global_index: u32,
}

/// Identifies the real output being spent inside the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealOutput {
    pub transaction_public_key: PublicKey,
    pub output_in_transaction: u32,
    /// Slot of the real output within [`InputKeyInfo::outputs`].
    pub ring_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputKeyInfo {
    pub amount: Amount,
    pub outputs: Vec<GlobalOutput>,
    pub real_output: RealOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// Structural mutation after a signature exists.
    AlreadySigned,
    MissingSecretKey,
    SecretKeyMismatch,
    IndexOutOfRange,
    WrongInputType,
    WrongOutputType,
    UnsortedOutputOffsets,
    InvalidTransactionBlob,
    InvalidExtra(ExtraError),
    Key(KeyError),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::AlreadySigned => write!(f, "transaction already has signatures"),
            TxError::MissingSecretKey => write!(f, "transaction secret key is not known"),
            TxError::SecretKeyMismatch => {
                write!(f, "secret key does not match the published transaction key")
            }
            TxError::IndexOutOfRange => write!(f, "input or output index out of range"),
            TxError::WrongInputType => write!(f, "operation does not apply to this input type"),
            TxError::WrongOutputType => write!(f, "operation does not apply to this output type"),
            TxError::UnsortedOutputOffsets => {
                write!(f, "output offsets are not strictly increasing")
            }
            TxError::InvalidTransactionBlob => write!(f, "malformed transaction blob"),
            TxError::InvalidExtra(err) => write!(f, "malformed extra field: {err}"),
            TxError::Key(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TxError {}

impl From<KeyError> for TxError {
    fn from(err: KeyError) -> Self {
        TxError::Key(err)
    }
}

impl From<ExtraError> for TxError {
    fn from(err: ExtraError) -> Self {
        TxError::InvalidExtra(err)
    }
}

/// Mutable transaction under construction. The transaction hash is memoized
/// and unconditionally invalidated by every mutation; once any signature has
/// been added, structural mutation is refused.
pub struct TransactionBuilder {
    transaction: Transaction,
    extra: TransactionExtra,
    secret_key: Option<SecretKey>,
    cached_hash: Cell<Option<Hash256>>,
}

impl TransactionBuilder {
    /// Fresh transaction with a newly generated key pair published in extra.
    #[must_use]
    pub fn new() -> Self {
        let tx_keys = generate_keys();
        let mut extra = TransactionExtra::default();
        extra.set_public_key(tx_keys.public_key);

        Self {
            transaction: Transaction {
                prefix: TransactionPrefix {
                    version: TRANSACTION_VERSION_1,
                    unlock_time: 0,
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                    extra: extra.to_bytes(),
                },
                signatures: Vec::new(),
            },
            extra,
            secret_key: Some(tx_keys.secret_key),
            cached_hash: Cell::new(None),
        }
    }

    /// Parses a serialized transaction. The blob hash seeds the memoized
    /// transaction hash so reserialization is not needed to identify it.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, TxError> {
        let transaction: Transaction =
            crate::codec::decode(blob).map_err(|_| TxError::InvalidTransactionBlob)?;
        let extra = TransactionExtra::parse(&transaction.prefix.extra)?;

        Ok(Self {
            transaction,
            extra,
            secret_key: None,
            cached_hash: Cell::new(Some(Hash256::hash_from_slice(blob))),
        })
    }

    pub fn from_transaction(transaction: Transaction) -> Result<Self, TxError> {
        let extra = TransactionExtra::parse(&transaction.prefix.extra)?;
        Ok(Self {
            transaction,
            extra,
            secret_key: None,
            cached_hash: Cell::new(None),
        })
    }

    fn invalidate_hash(&self) {
        self.cached_hash.set(None);
    }

    fn check_if_signing(&self) -> Result<(), TxError> {
        if self.transaction.signatures.iter().any(|sigs| !sigs.is_empty()) {
            return Err(TxError::AlreadySigned);
        }
        Ok(())
    }

    fn secret_key(&self) -> Result<&SecretKey, TxError> {
        self.secret_key.as_ref().ok_or(TxError::MissingSecretKey)
    }

    fn signatures_slot(&mut self, input: usize) -> Result<&mut Vec<Signature>, TxError> {
        if input >= self.transaction.prefix.inputs.len() {
            return Err(TxError::IndexOutOfRange);
        }
        if self.transaction.signatures.len() < self.transaction.prefix.inputs.len() {
            self.transaction
                .signatures
                .resize(self.transaction.prefix.inputs.len(), Vec::new());
        }
        Ok(&mut self.transaction.signatures[input])
    }

    // ---- read surface ----

    pub fn transaction_hash(&self) -> Hash256 {
        if let Some(hash) = self.cached_hash.get() {
            return hash;
        }
        let hash = self.transaction.hash();
        self.cached_hash.set(Some(hash));
        hash
    }

    pub fn prefix_hash(&self) -> Hash256 {
        self.transaction.prefix.hash()
    }

    pub fn inputs_hash(&self) -> Hash256 {
        self.transaction.prefix.inputs_hash()
    }

    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.extra.public_key()
    }

    #[must_use]
    pub fn unlock_time(&self) -> u64 {
        self.transaction.prefix.unlock_time
    }

    #[must_use]
    pub fn payment_id(&self) -> Option<Hash256> {
        self.extra.payment_id()
    }

    #[must_use]
    pub fn extra_nonce(&self) -> Option<&[u8]> {
        self.extra.nonce()
    }

    #[must_use]
    pub fn extra(&self) -> &[u8] {
        &self.transaction.prefix.extra
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        self.transaction.prefix.inputs.len()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.transaction.prefix.outputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&TransactionInput, TxError> {
        self.transaction
            .prefix
            .inputs
            .get(index)
            .ok_or(TxError::IndexOutOfRange)
    }

    pub fn output(&self, index: usize) -> Result<&TransactionOutput, TxError> {
        self.transaction
            .prefix
            .outputs
            .get(index)
            .ok_or(TxError::IndexOutOfRange)
    }

    pub fn required_signatures_count(&self, input: usize) -> Result<usize, TxError> {
        Ok(self.input(input)?.required_signatures_count())
    }

    #[must_use]
    pub fn as_transaction(&self) -> &Transaction {
        &self.transaction
    }

    #[must_use]
    pub fn into_transaction(self) -> Transaction {
        self.transaction
    }

    /// Serialized wire form; round-trips through [`TransactionBuilder::from_bytes`].
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.transaction.to_bytes()
    }

    pub fn transaction_secret_key(&self) -> Option<SecretKey> {
        self.secret_key
    }

    // ---- mutation surface (frozen once signing has started) ----

    pub fn set_unlock_time(&mut self, unlock_time: u64) -> Result<(), TxError> {
        self.check_if_signing()?;
        self.transaction.prefix.unlock_time = unlock_time;
        self.invalidate_hash();
        Ok(())
    }

    pub fn set_payment_id(&mut self, id: &Hash256) -> Result<(), TxError> {
        self.check_if_signing()?;
        self.extra.set_payment_id(id)?;
        self.transaction.prefix.extra = self.extra.to_bytes();
        self.invalidate_hash();
        Ok(())
    }

    pub fn set_extra_nonce(&mut self, nonce: Vec<u8>) -> Result<(), TxError> {
        self.check_if_signing()?;
        self.extra.set_nonce(nonce)?;
        self.transaction.prefix.extra = self.extra.to_bytes();
        self.invalidate_hash();
        Ok(())
    }

    /// Appends raw bytes to extra without reparsing. The caller is trusted to
    /// append well formed tags.
    pub fn append_extra(&mut self, data: &[u8]) -> Result<(), TxError> {
        self.check_if_signing()?;
        self.transaction.prefix.extra.extend_from_slice(data);
        self.invalidate_hash();
        Ok(())
    }

    pub fn set_transaction_secret_key(&mut self, key: SecretKey) -> Result<(), TxError> {
        let published = self.extra.public_key().ok_or(TxError::SecretKeyMismatch)?;
        if secret_to_public(&key) != published {
            return Err(TxError::SecretKeyMismatch);
        }
        self.secret_key = Some(key);
        Ok(())
    }

    /// Replaces the transaction key pair with one derived from `seed` and the
    /// hash of the current input set. Air-gapped signers can regenerate the
    /// same key without persisted randomness.
    pub fn set_deterministic_secret_key(&mut self, seed: &SecretKey) -> Result<(), TxError> {
        self.check_if_signing()?;
        let keys = generate_deterministic_transaction_keys(&self.inputs_hash(), seed);
        self.extra.set_public_key(keys.public_key);
        self.transaction.prefix.extra = self.extra.to_bytes();
        self.secret_key = Some(keys.secret_key);
        self.invalidate_hash();
        Ok(())
    }

    pub fn add_key_input(&mut self, input: KeyInput) -> Result<usize, TxError> {
        self.check_if_signing()?;
        self.transaction
            .prefix
            .inputs
            .push(TransactionInput::Key(input));
        self.invalidate_hash();
        Ok(self.transaction.prefix.inputs.len() - 1)
    }

    pub fn add_multisignature_input(
        &mut self,
        input: MultisignatureInput,
    ) -> Result<usize, TxError> {
        self.check_if_signing()?;
        self.transaction
            .prefix
            .inputs
            .push(TransactionInput::Multisignature(input));
        self.transaction.prefix.version = TRANSACTION_VERSION_2;
        self.invalidate_hash();
        Ok(self.transaction.prefix.inputs.len() - 1)
    }

    /// Derives the ephemeral keys and key image for the real output named by
    /// `info` and appends the corresponding ring input. Returns the input
    /// index and the ephemeral key pair the caller needs for
    /// [`TransactionBuilder::sign_input_key`].
    pub fn add_tracked_input(
        &mut self,
        sender: &AccountKeys,
        info: &InputKeyInfo,
    ) -> Result<(usize, KeyPair), TxError> {
        self.check_if_signing()?;

        let (ephemeral_keys, key_image) = generate_key_image_helper(
            sender,
            &info.real_output.transaction_public_key,
            u64::from(info.real_output.output_in_transaction),
        )?;

        let absolute: Vec<u32> = info.outputs.iter().map(|out| out.global_index).collect();
        let input = KeyInput {
            amount: info.amount,
            output_offsets: absolute_offsets_to_relative(&absolute)?,
            key_image,
        };

        let index = self.add_key_input(input)?;
        Ok((index, ephemeral_keys))
    }

    pub fn add_key_output(
        &mut self,
        amount: Amount,
        to: &AccountPublicAddress,
    ) -> Result<usize, TxError> {
        self.check_if_signing()?;

        let index = self.transaction.prefix.outputs.len();
        let derivation = generate_key_derivation(&to.view_public_key, self.secret_key()?)?;
        let key = derive_public_key(&derivation, index as u64, &to.spend_public_key)?;

        self.transaction.prefix.outputs.push(TransactionOutput {
            amount,
            target: TransactionOutputTarget::Key(KeyOutput { key }),
        });
        self.invalidate_hash();
        Ok(index)
    }

    pub fn add_multisignature_output(
        &mut self,
        amount: Amount,
        to: &[AccountPublicAddress],
        required_signatures: u8,
        term: u32,
    ) -> Result<usize, TxError> {
        self.check_if_signing()?;

        let index = self.transaction.prefix.outputs.len();
        let secret = *self.secret_key()?;
        let mut keys = Vec::with_capacity(to.len());
        for address in to {
            let derivation = generate_key_derivation(&address.view_public_key, &secret)?;
            keys.push(derive_public_key(
                &derivation,
                index as u64,
                &address.spend_public_key,
            )?);
        }

        self.transaction.prefix.outputs.push(TransactionOutput {
            amount,
            target: TransactionOutputTarget::Multisignature(MultisignatureOutput {
                keys,
                required_signature_count: required_signatures,
                term,
            }),
        });
        self.transaction.prefix.version = TRANSACTION_VERSION_2;
        self.invalidate_hash();
        Ok(index)
    }

    pub fn add_raw_output(
        &mut self,
        amount: Amount,
        target: TransactionOutputTarget,
    ) -> Result<usize, TxError> {
        self.check_if_signing()?;
        let index = self.transaction.prefix.outputs.len();
        if target.output_type() == OutputType::Multisignature {
            self.transaction.prefix.version = TRANSACTION_VERSION_2;
        }
        self.transaction
            .prefix
            .outputs
            .push(TransactionOutput { amount, target });
        self.invalidate_hash();
        Ok(index)
    }

    // ---- signing ----

    /// Ring signature over the prefix hash. The signer's slot is
    /// `info.real_output.ring_index`; the ring is the candidate set in its
    /// original order.
    pub fn sign_input_key(
        &mut self,
        input: usize,
        info: &InputKeyInfo,
        ephemeral_keys: &KeyPair,
    ) -> Result<(), TxError> {
        let key_image = match self.input(input)? {
            TransactionInput::Key(key_input) => key_input.key_image,
            TransactionInput::Multisignature(_) => return Err(TxError::WrongInputType),
        };

        let prefix_hash = self.prefix_hash();
        let ring: Vec<PublicKey> = info.outputs.iter().map(|out| out.public_key).collect();
        let signatures = generate_ring_signature(
            &prefix_hash,
            &key_image,
            &ring,
            &ephemeral_keys.secret_key,
            info.real_output.ring_index,
        )?;

        *self.signatures_slot(input)? = signatures;
        self.invalidate_hash();
        Ok(())
    }

    /// Multisignature co-signer path: derives the ephemeral keys from the
    /// source transaction and appends one ordinary signature. Called once per
    /// co-signer.
    pub fn sign_input_multisignature(
        &mut self,
        input: usize,
        source_transaction_key: &PublicKey,
        output_index: u64,
        account: &AccountKeys,
    ) -> Result<(), TxError> {
        let derivation =
            generate_key_derivation(source_transaction_key, &account.view_secret_key)?;
        let ephemeral_public =
            derive_public_key(&derivation, output_index, &account.address.spend_public_key)?;
        let ephemeral_secret =
            derive_secret_key(&derivation, output_index, &account.spend_secret_key);

        self.sign_input_multisignature_with_keys(
            input,
            &KeyPair {
                public_key: ephemeral_public,
                secret_key: ephemeral_secret,
            },
        )
    }

    pub fn sign_input_multisignature_with_keys(
        &mut self,
        input: usize,
        ephemeral_keys: &KeyPair,
    ) -> Result<(), TxError> {
        if self.input(input)?.input_type() != InputType::Multisignature {
            return Err(TxError::WrongInputType);
        }

        let prefix_hash = self.prefix_hash();
        let signature = generate_signature(
            &prefix_hash,
            &ephemeral_keys.public_key,
            &ephemeral_keys.secret_key,
        );

        self.signatures_slot(input)?.push(signature);
        self.invalidate_hash();
        Ok(())
    }

    // ---- validation ----

    #[must_use]
    pub fn validate_inputs(&self) -> bool {
        self.transaction.prefix.validate_inputs()
    }

    #[must_use]
    pub fn validate_outputs(&self) -> bool {
        self.transaction.prefix.validate_outputs()
    }

    #[must_use]
    pub fn validate_signatures(&self) -> bool {
        self.transaction.validate_signatures()
    }

    /// Checks a single-signer ring signature against the candidate set, for
    /// callers that want cryptographic verification beyond the structural
    /// [`TransactionBuilder::validate_signatures`].
    pub fn verify_input_key_signature(
        &self,
        input: usize,
        ring: &[PublicKey],
    ) -> Result<bool, TxError> {
        let key_image = match self.input(input)? {
            TransactionInput::Key(key_input) => key_input.key_image,
            TransactionInput::Multisignature(_) => return Err(TxError::WrongInputType),
        };
        let Some(signatures) = self.transaction.signatures.get(input) else {
            return Ok(false);
        };
        Ok(check_ring_signature(
            &self.prefix_hash(),
            &key_image,
            ring,
            signatures,
        ))
    }

    /// Verifies one accumulated multisignature against an ephemeral public
    /// key.
    pub fn verify_input_multisignature(
        &self,
        input: usize,
        signature_index: usize,
        ephemeral_public: &PublicKey,
    ) -> Result<bool, TxError> {
        if self.input(input)?.input_type() != InputType::Multisignature {
            return Err(TxError::WrongInputType);
        }
        let signature = self
            .transaction
            .signatures
            .get(input)
            .and_then(|sigs| sigs.get(signature_index))
            .ok_or(TxError::IndexOutOfRange)?;
        Ok(check_signature(
            &self.prefix_hash(),
            ephemeral_public,
            signature,
        ))
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans a transaction's outputs for the given account. Returns the output
/// indices addressed to it and their total amount.
pub fn find_outputs_to_account(
    prefix: &TransactionPrefix,
    address: &AccountPublicAddress,
    view_secret: &SecretKey,
) -> Result<(Vec<u32>, Amount), KeyError> {
    let extra = match TransactionExtra::parse(&prefix.extra) {
        Ok(extra) => extra,
        Err(_) => return Ok((Vec::new(), 0)),
    };
    let Some(tx_public_key) = extra.public_key() else {
        return Ok((Vec::new(), 0));
    };

    let derivation = generate_key_derivation(&tx_public_key, view_secret)?;
    let mut found = Vec::new();
    let mut amount: Amount = 0;

    for (index, output) in prefix.outputs.iter().enumerate() {
        let expected = derive_public_key(&derivation, index as u64, &address.spend_public_key)?;
        let ours = match &output.target {
            TransactionOutputTarget::Key(target) => target.key == expected,
            TransactionOutputTarget::Multisignature(target) => target.keys.contains(&expected),
        };
        if ours {
            found.push(index as u32);
            amount = amount.saturating_add(output.amount);
        }
    }

    Ok((found, amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn account() -> AccountKeys {
        let spend = generate_keys();
        let view = generate_keys();
        AccountKeys {
            address: AccountPublicAddress {
                spend_public_key: spend.public_key,
                view_public_key: view.public_key,
            },
            spend_secret_key: spend.secret_key,
            view_secret_key: view.secret_key,
        }
    }

    fn ring_input_info(sender: &AccountKeys) -> (InputKeyInfo, KeyPair) {
        // Fabricate the on-chain transaction that paid the sender.
        let source_tx = generate_keys();
        let derivation =
            generate_key_derivation(&sender.address.view_public_key, &source_tx.secret_key)
                .unwrap();
        let one_time =
            derive_public_key(&derivation, 0, &sender.address.spend_public_key).unwrap();

        let mut outputs = vec![
            GlobalOutput {
                public_key: generate_keys().public_key,
                global_index: 10,
            },
            GlobalOutput {
                public_key: one_time,
                global_index: 25,
            },
            GlobalOutput {
                public_key: generate_keys().public_key,
                global_index: 40,
            },
        ];
        outputs.sort_by_key(|out| out.global_index);

        let info = InputKeyInfo {
            amount: 1000,
            outputs,
            real_output: RealOutput {
                transaction_public_key: source_tx.public_key,
                output_in_transaction: 0,
                ring_index: 1,
            },
        };
        let eph = generate_key_image_helper(sender, &source_tx.public_key, 0)
            .map(|(keys, _)| keys)
            .unwrap();
        (info, eph)
    }

    fn signed_transfer() -> (TransactionBuilder, InputKeyInfo) {
        let sender = account();
        let receiver = account();
        let mut builder = TransactionBuilder::new();
        let (info, _) = ring_input_info(&sender);

        let (index, eph) = builder.add_tracked_input(&sender, &info).unwrap();
        builder.add_key_output(900, &receiver.address).unwrap();
        builder.sign_input_key(index, &info, &eph).unwrap();
        (builder, info)
    }

    #[test]
    fn build_sign_validate() {
        let (builder, info) = signed_transfer();

        assert!(builder.validate_inputs());
        assert!(builder.validate_outputs());
        assert!(builder.validate_signatures());

        let ring: Vec<PublicKey> = info.outputs.iter().map(|o| o.public_key).collect();
        assert!(builder.verify_input_key_signature(0, &ring).unwrap());
    }

    #[test]
    fn roundtrip_preserves_hash_and_body() {
        let (builder, _) = signed_transfer();
        let parsed = TransactionBuilder::from_bytes(&builder.to_bytes()).unwrap();

        assert_eq!(parsed.transaction_hash(), builder.transaction_hash());
        assert_eq!(parsed.as_transaction(), builder.as_transaction());
    }

    #[test]
    fn mutation_after_signing_fails() {
        let (mut builder, _) = signed_transfer();
        let receiver = account();

        assert_eq!(
            builder.set_unlock_time(10).unwrap_err(),
            TxError::AlreadySigned
        );
        assert_eq!(
            builder.add_key_output(1, &receiver.address).unwrap_err(),
            TxError::AlreadySigned
        );
        assert_eq!(
            builder
                .set_payment_id(&Hash256::hash_from_slice(b"id"))
                .unwrap_err(),
            TxError::AlreadySigned
        );
        assert_eq!(
            builder
                .add_key_input(KeyInput {
                    amount: 1,
                    output_offsets: vec![1],
                    key_image: KeyImage::zero(),
                })
                .unwrap_err(),
            TxError::AlreadySigned
        );
    }

    #[test]
    fn hash_memoization_invalidated_by_mutation() {
        let mut builder = TransactionBuilder::new();
        let before = builder.transaction_hash();

        builder.set_unlock_time(77).unwrap();
        let after = builder.transaction_hash();
        assert_ne!(before, after);

        // Setting the same value again still invalidates and recomputes to
        // the same digest.
        builder.set_unlock_time(77).unwrap();
        assert_eq!(builder.transaction_hash(), after);
    }

    #[test]
    fn multisignature_accumulates_signatures() {
        let co_signer_a = account();
        let co_signer_b = account();
        let mut builder = TransactionBuilder::new();

        let index = builder
            .add_multisignature_input(MultisignatureInput {
                amount: 500,
                signature_count: 2,
                output_index: 7,
                term: 0,
            })
            .unwrap();
        builder
            .add_key_output(400, &co_signer_a.address)
            .unwrap();

        assert!(!builder.validate_signatures());

        let source_key = generate_keys().public_key;
        builder
            .sign_input_multisignature(index, &source_key, 0, &co_signer_a)
            .unwrap();
        assert!(!builder.validate_signatures());

        builder
            .sign_input_multisignature(index, &source_key, 0, &co_signer_b)
            .unwrap();
        assert!(builder.validate_signatures());
    }

    #[test]
    fn duplicate_key_images_fail_validation() {
        let mut builder = TransactionBuilder::new();
        let image = generate_keys();
        let key_image = crate::crypto::generate_key_image(&image.public_key, &image.secret_key);

        for _ in 0..2 {
            builder
                .add_key_input(KeyInput {
                    amount: 10,
                    output_offsets: vec![1, 2],
                    key_image,
                })
                .unwrap();
        }

        assert!(!builder.validate_inputs());
    }

    #[test]
    fn overflowing_amounts_fail_validation() {
        let mut builder = TransactionBuilder::new();
        for _ in 0..2 {
            let keys = generate_keys();
            builder
                .add_key_input(KeyInput {
                    amount: u64::MAX / 2 + 1,
                    output_offsets: vec![1],
                    key_image: crate::crypto::generate_key_image(
                        &keys.public_key,
                        &keys.secret_key,
                    ),
                })
                .unwrap();
        }
        assert!(!builder.validate_inputs());
    }

    #[test]
    fn payment_id_roundtrip() {
        let mut builder = TransactionBuilder::new();
        let id = Hash256::hash_from_slice(b"invoice-42");
        builder.set_payment_id(&id).unwrap();

        let parsed = TransactionBuilder::from_bytes(&builder.to_bytes()).unwrap();
        assert_eq!(parsed.payment_id(), Some(id));
    }

    #[test]
    fn deterministic_secret_key_matches_published_key() {
        let mut builder = TransactionBuilder::new();
        let seed = generate_keys().secret_key;
        builder.set_deterministic_secret_key(&seed).unwrap();

        let secret = builder.transaction_secret_key().unwrap();
        assert_eq!(secret_to_public(&secret), builder.public_key().unwrap());
    }

    #[test]
    fn set_secret_key_must_match_public() {
        let mut builder = TransactionBuilder::new();
        assert_eq!(
            builder
                .set_transaction_secret_key(generate_keys().secret_key)
                .unwrap_err(),
            TxError::SecretKeyMismatch
        );

        let current = builder.transaction_secret_key().unwrap();
        builder.set_transaction_secret_key(current).unwrap();
    }

    #[test]
    fn find_outputs_to_account_sees_own_outputs() {
        let receiver = account();
        let stranger = account();
        let mut builder = TransactionBuilder::new();
        builder.add_key_output(300, &receiver.address).unwrap();
        builder.add_key_output(200, &stranger.address).unwrap();
        builder.add_key_output(100, &receiver.address).unwrap();

        let (indices, amount) = find_outputs_to_account(
            &builder.as_transaction().prefix,
            &receiver.address,
            &receiver.view_secret_key,
        )
        .unwrap();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(amount, 400);
    }

    #[quickcheck]
    fn offsets_roundtrip(mut offsets: Vec<u32>) -> bool {
        offsets.sort_unstable();
        offsets.dedup();
        let Ok(relative) = absolute_offsets_to_relative(&offsets) else {
            return false;
        };
        relative_offsets_to_absolute(&relative).unwrap() == offsets
    }

    #[test]
    fn unsorted_offsets_rejected() {
        assert_eq!(
            absolute_offsets_to_relative(&[5, 3]).unwrap_err(),
            TxError::UnsortedOutputOffsets
        );
    }
}
