// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Tagged `extra` payload of a transaction: transaction public key, free form
//! nonce and the payment id carried inside the nonce.

use crate::crypto::{Hash256, PublicKey};

const TAG_PADDING: u8 = 0x00;
const TAG_PUBLIC_KEY: u8 = 0x01;
const TAG_NONCE: u8 = 0x02;

const NONCE_PAYMENT_ID: u8 = 0x00;

pub const TX_EXTRA_PADDING_MAX_SIZE: usize = 255;
pub const TX_EXTRA_NONCE_MAX_SIZE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraError {
    Truncated,
    UnknownTag(u8),
    PaddingTooLarge,
    NonceTooLarge,
}

impl std::fmt::Display for ExtraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtraError::Truncated => write!(f, "extra field truncated"),
            ExtraError::UnknownTag(tag) => write!(f, "unknown extra tag {tag:#04x}"),
            ExtraError::PaddingTooLarge => write!(f, "extra padding exceeds maximum"),
            ExtraError::NonceTooLarge => write!(f, "extra nonce exceeds maximum"),
        }
    }
}

impl std::error::Error for ExtraError {}

/// Parsed view of the `extra` bytes. Serialization order is fixed: public
/// key, then nonce, then padding, so re-encoding a parsed field set is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionExtra {
    public_key: Option<PublicKey>,
    nonce: Option<Vec<u8>>,
    padding: usize,
}

impl TransactionExtra {
    pub fn parse(data: &[u8]) -> Result<Self, ExtraError> {
        let mut extra = TransactionExtra::default();
        let mut cursor = 0usize;

        while cursor < data.len() {
            let tag = data[cursor];
            cursor += 1;
            match tag {
                TAG_PADDING => {
                    // Padding is a run of zero bytes terminating the field.
                    let rest = &data[cursor..];
                    if rest.len() > TX_EXTRA_PADDING_MAX_SIZE {
                        return Err(ExtraError::PaddingTooLarge);
                    }
                    if rest.iter().any(|&b| b != 0) {
                        return Err(ExtraError::UnknownTag(TAG_PADDING));
                    }
                    extra.padding = 1 + rest.len();
                    cursor = data.len();
                }
                TAG_PUBLIC_KEY => {
                    let end = cursor.checked_add(32).ok_or(ExtraError::Truncated)?;
                    let bytes = data.get(cursor..end).ok_or(ExtraError::Truncated)?;
                    let mut key = [0u8; 32];
                    key.copy_from_slice(bytes);
                    extra.public_key = Some(PublicKey(key));
                    cursor = end;
                }
                TAG_NONCE => {
                    let len = *data.get(cursor).ok_or(ExtraError::Truncated)? as usize;
                    if len > TX_EXTRA_NONCE_MAX_SIZE {
                        return Err(ExtraError::NonceTooLarge);
                    }
                    cursor += 1;
                    let end = cursor.checked_add(len).ok_or(ExtraError::Truncated)?;
                    let bytes = data.get(cursor..end).ok_or(ExtraError::Truncated)?;
                    extra.nonce = Some(bytes.to_vec());
                    cursor = end;
                }
                other => return Err(ExtraError::UnknownTag(other)),
            }
        }

        Ok(extra)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(key) = &self.public_key {
            out.push(TAG_PUBLIC_KEY);
            out.extend_from_slice(key.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            out.push(TAG_NONCE);
            out.push(nonce.len() as u8);
            out.extend_from_slice(nonce);
        }
        if self.padding > 0 {
            out.resize(out.len() + self.padding, TAG_PADDING);
        }
        out
    }

    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key
    }

    pub fn set_public_key(&mut self, key: PublicKey) {
        self.public_key = Some(key);
    }

    #[must_use]
    pub fn nonce(&self) -> Option<&[u8]> {
        self.nonce.as_deref()
    }

    pub fn set_nonce(&mut self, nonce: Vec<u8>) -> Result<(), ExtraError> {
        if nonce.len() > TX_EXTRA_NONCE_MAX_SIZE {
            return Err(ExtraError::NonceTooLarge);
        }
        self.nonce = Some(nonce);
        Ok(())
    }

    /// The payment id is a 32 byte hash carried in a nonce prefixed with
    /// [`NONCE_PAYMENT_ID`].
    #[must_use]
    pub fn payment_id(&self) -> Option<Hash256> {
        let nonce = self.nonce.as_ref()?;
        if nonce.len() != 33 || nonce[0] != NONCE_PAYMENT_ID {
            return None;
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&nonce[1..]);
        Some(Hash256(id))
    }

    pub fn set_payment_id(&mut self, id: &Hash256) -> Result<(), ExtraError> {
        let mut nonce = Vec::with_capacity(33);
        nonce.push(NONCE_PAYMENT_ID);
        nonce.extend_from_slice(id.as_bytes());
        self.set_nonce(nonce)
    }
}
