// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak512};
use std::fmt;

use crate::crypto::Hash256;

/// Errors from key material handling. These are data errors, not programmer
/// errors: malformed points and non-canonical scalars arrive from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    InvalidPoint,
    InvalidSecretKey,
    MismatchedKeys,
    InvalidRingIndex,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidPoint => write!(f, "not a valid curve point"),
            KeyError::InvalidSecretKey => write!(f, "not a valid secret key"),
            KeyError::MismatchedKeys => write!(f, "secret key does not match public key"),
            KeyError::InvalidRingIndex => write!(f, "real output index outside the ring"),
        }
    }
}

impl std::error::Error for KeyError {}

macro_rules! key_newtype {
    ($name:ident, $len:expr) => {
        #[derive(PartialEq, Eq, Encode, Decode, Clone, Copy, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            #[must_use]
            pub fn zero() -> Self {
                Self([0; $len])
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

key_newtype!(PublicKey, 32);
key_newtype!(SecretKey, 32);
key_newtype!(KeyImage, 32);
key_newtype!(KeyDerivation, 32);
key_newtype!(Signature, 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

/// Public half of an account: the (spend, view) key pair an address encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AccountPublicAddress {
    pub spend_public_key: PublicKey,
    pub view_public_key: PublicKey,
}

/// Full key material of a tracked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct AccountKeys {
    pub address: AccountPublicAddress,
    pub spend_secret_key: SecretKey,
    pub view_secret_key: SecretKey,
}

pub(crate) fn decompress(key: &PublicKey) -> Result<EdwardsPoint, KeyError> {
    CompressedEdwardsY(key.0)
        .decompress()
        .ok_or(KeyError::InvalidPoint)
}

pub(crate) fn decompress_key_image(image: &KeyImage) -> Result<EdwardsPoint, KeyError> {
    CompressedEdwardsY(image.0)
        .decompress()
        .ok_or(KeyError::InvalidPoint)
}

pub(crate) fn secret_scalar(key: &SecretKey) -> Scalar {
    Scalar::from_bytes_mod_order(key.0)
}

pub(crate) fn hash_to_scalar(chunks: &[&[u8]]) -> Scalar {
    let mut hasher = Keccak512::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    Scalar::from_hash(hasher)
}

/// Maps a public key to a second, unrelated group element. Key images and
/// ring signature responses are computed against this base.
pub(crate) fn hash_to_point(key: &PublicKey) -> EdwardsPoint {
    EdwardsPoint::mul_base(&hash_to_scalar(&[b"duskcoin.hash_to_point", key.as_bytes()]))
}

#[must_use]
pub fn generate_keys() -> KeyPair {
    let secret = Scalar::random(&mut OsRng);
    KeyPair {
        public_key: PublicKey(EdwardsPoint::mul_base(&secret).compress().to_bytes()),
        secret_key: SecretKey(secret.to_bytes()),
    }
}

pub fn secret_to_public(secret: &SecretKey) -> PublicKey {
    PublicKey(EdwardsPoint::mul_base(&secret_scalar(secret)).compress().to_bytes())
}

/// Shared secret between a transaction key and an account view key:
/// `D = 8 * secret * public`.
pub fn generate_key_derivation(
    public: &PublicKey,
    secret: &SecretKey,
) -> Result<KeyDerivation, KeyError> {
    let point = decompress(public)?;
    let shared = (point * secret_scalar(secret)).mul_by_cofactor();
    Ok(KeyDerivation(shared.compress().to_bytes()))
}

fn derivation_scalar(derivation: &KeyDerivation, output_index: u64) -> Scalar {
    hash_to_scalar(&[
        b"duskcoin.derivation",
        derivation.as_bytes(),
        &output_index.to_le_bytes(),
    ])
}

/// One-time output key: `P = Hs(D || i) * G + B`.
pub fn derive_public_key(
    derivation: &KeyDerivation,
    output_index: u64,
    base: &PublicKey,
) -> Result<PublicKey, KeyError> {
    let base_point = decompress(base)?;
    let point = EdwardsPoint::mul_base(&derivation_scalar(derivation, output_index)) + base_point;
    Ok(PublicKey(point.compress().to_bytes()))
}

/// One-time secret key matching [`derive_public_key`]: `x = Hs(D || i) + b`.
pub fn derive_secret_key(
    derivation: &KeyDerivation,
    output_index: u64,
    base: &SecretKey,
) -> SecretKey {
    let scalar = derivation_scalar(derivation, output_index) + secret_scalar(base);
    SecretKey(scalar.to_bytes())
}

/// Ephemeral keys and key image for spending the output at `output_index` of
/// a transaction whose public key is `tx_public_key`.
pub fn generate_key_image_helper(
    account: &AccountKeys,
    tx_public_key: &PublicKey,
    output_index: u64,
) -> Result<(KeyPair, KeyImage), KeyError> {
    let derivation = generate_key_derivation(tx_public_key, &account.view_secret_key)?;
    let ephemeral_public =
        derive_public_key(&derivation, output_index, &account.address.spend_public_key)?;
    let ephemeral_secret = derive_secret_key(&derivation, output_index, &account.spend_secret_key);

    if secret_to_public(&ephemeral_secret) != ephemeral_public {
        return Err(KeyError::MismatchedKeys);
    }

    let image = generate_key_image(&ephemeral_public, &ephemeral_secret);
    Ok((
        KeyPair {
            public_key: ephemeral_public,
            secret_key: ephemeral_secret,
        },
        image,
    ))
}

/// `I = x * Hp(P)`, the per-output spend tracking value.
#[must_use]
pub fn generate_key_image(public: &PublicKey, secret: &SecretKey) -> KeyImage {
    let image = hash_to_point(public) * secret_scalar(secret);
    KeyImage(image.compress().to_bytes())
}

/// Deterministic transaction keys for air-gapped signing: derived from a
/// caller supplied seed and the hash of the transaction's own input set, so
/// no randomness has to be persisted between signing sessions.
#[must_use]
pub fn generate_deterministic_transaction_keys(
    inputs_hash: &Hash256,
    seed: &SecretKey,
) -> KeyPair {
    let secret = hash_to_scalar(&[
        b"duskcoin.deterministic_tx_key",
        seed.as_bytes(),
        inputs_hash.as_bytes(),
    ]);
    KeyPair {
        public_key: PublicKey(EdwardsPoint::mul_base(&secret).compress().to_bytes()),
        secret_key: SecretKey(secret.to_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_match() {
        let tx_keys = generate_keys();
        let spend = generate_keys();
        let view = generate_keys();
        let account = AccountKeys {
            address: AccountPublicAddress {
                spend_public_key: spend.public_key,
                view_public_key: view.public_key,
            },
            spend_secret_key: spend.secret_key,
            view_secret_key: view.secret_key,
        };

        // Sender derives the one-time key with the tx secret, receiver with
        // the view secret. Both must land on the same point.
        let sender_derivation =
            generate_key_derivation(&view.public_key, &tx_keys.secret_key).unwrap();
        let receiver_derivation =
            generate_key_derivation(&tx_keys.public_key, &view.secret_key).unwrap();
        assert_eq!(sender_derivation, receiver_derivation);

        let one_time =
            derive_public_key(&sender_derivation, 3, &spend.public_key).unwrap();
        let (ephemeral, _image) =
            generate_key_image_helper(&account, &tx_keys.public_key, 3).unwrap();
        assert_eq!(ephemeral.public_key, one_time);
    }

    #[test]
    fn key_image_is_deterministic() {
        let keys = generate_keys();
        let a = generate_key_image(&keys.public_key, &keys.secret_key);
        let b = generate_key_image(&keys.public_key, &keys.secret_key);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_tx_keys_depend_on_inputs() {
        let seed = generate_keys().secret_key;
        let h1 = Hash256::hash_from_slice(b"inputs-1");
        let h2 = Hash256::hash_from_slice(b"inputs-2");
        assert_eq!(
            generate_deterministic_transaction_keys(&h1, &seed),
            generate_deterministic_transaction_keys(&h1, &seed)
        );
        assert_ne!(
            generate_deterministic_transaction_keys(&h1, &seed),
            generate_deterministic_transaction_keys(&h2, &seed)
        );
    }

    #[test]
    fn rejects_invalid_point() {
        let secret = generate_keys().secret_key;
        // Roughly half of all 32 byte strings are not curve points; find one.
        let bogus = (0u8..=255)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[0] = i;
                bytes[31] = 0x05;
                PublicKey(bytes)
            })
            .find(|key| decompress(key).is_err())
            .unwrap();
        assert_eq!(
            generate_key_derivation(&bogus, &secret),
            Err(KeyError::InvalidPoint)
        );
    }
}
