// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use sha3::{Digest, Keccak256};
use std::fmt;

/// 32 byte Keccak-256 digest. Transaction ids, block ids and payment ids are
/// all values of this type.
#[derive(PartialEq, Eq, Encode, Decode, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[inline]
    pub fn hash_from_slice<T: AsRef<[u8]>>(slice: T) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(slice.as_ref());
        Self(hasher.finalize().into())
    }

    /// Hashes the codec encoding of `val`.
    pub fn hash_object<T: bincode::Encode>(
        val: &T,
    ) -> Result<Self, bincode::error::EncodeError> {
        Ok(Self::hash_from_slice(crate::codec::encode_to_vec(val)?))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
