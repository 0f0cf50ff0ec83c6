// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Ordinary and ring signatures over transaction prefix hashes.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::VartimeMultiscalarMul;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak512};

use crate::crypto::hash::Hash256;
use crate::crypto::keys::{
    decompress, decompress_key_image, hash_to_point, secret_scalar, KeyError, KeyImage, PublicKey,
    SecretKey, Signature,
};

fn split_signature(sig: &Signature) -> (Scalar, Scalar) {
    let mut c = [0u8; 32];
    let mut r = [0u8; 32];
    c.copy_from_slice(&sig.0[..32]);
    r.copy_from_slice(&sig.0[32..]);
    (Scalar::from_bytes_mod_order(c), Scalar::from_bytes_mod_order(r))
}

fn join_signature(c: &Scalar, r: &Scalar) -> Signature {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&c.to_bytes());
    out[32..].copy_from_slice(&r.to_bytes());
    Signature(out)
}

/// Schnorr style signature: `c = Hs(m || P || kG)`, `r = k - c * x`.
pub fn generate_signature(
    prefix_hash: &Hash256,
    public: &PublicKey,
    secret: &SecretKey,
) -> Signature {
    let x = secret_scalar(secret);
    let k = Scalar::random(&mut OsRng);
    let commitment = EdwardsPoint::mul_base(&k);

    let mut hasher = Keccak512::new();
    hasher.update(prefix_hash.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(commitment.compress().as_bytes());
    let c = Scalar::from_hash(hasher);

    join_signature(&c, &(k - c * x))
}

pub fn check_signature(
    prefix_hash: &Hash256,
    public: &PublicKey,
    signature: &Signature,
) -> bool {
    let Ok(point) = decompress(public) else {
        return false;
    };
    let (c, r) = split_signature(signature);

    // r*G + c*P reproduces the commitment for a valid signature.
    let commitment = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &point, &r);

    let mut hasher = Keccak512::new();
    hasher.update(prefix_hash.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(commitment.compress().as_bytes());

    Scalar::from_hash(hasher) == c
}

/// Ring signature proving that the signer owns the secret key of one ring
/// member and that `key_image` is that member's spend tracking value.
///
/// `real_index` is the signer's slot within `ring`. The ring order is part of
/// the signed statement; callers must pass the members in the order they were
/// serialized into the input.
pub fn generate_ring_signature(
    prefix_hash: &Hash256,
    key_image: &KeyImage,
    ring: &[PublicKey],
    secret: &SecretKey,
    real_index: usize,
) -> Result<Vec<Signature>, KeyError> {
    if real_index >= ring.len() {
        return Err(KeyError::InvalidRingIndex);
    }

    let image_point = decompress_key_image(key_image)?;
    let x = secret_scalar(secret);
    let k = Scalar::random(&mut OsRng);

    let mut parts: Vec<(Scalar, Scalar)> = vec![(Scalar::ZERO, Scalar::ZERO); ring.len()];
    let mut challenge_sum = Scalar::ZERO;

    let mut hasher = Keccak512::new();
    hasher.update(prefix_hash.as_bytes());

    for (i, member) in ring.iter().enumerate() {
        let base = hash_to_point(member);
        let (commitment_g, commitment_h) = if i == real_index {
            (EdwardsPoint::mul_base(&k), base * k)
        } else {
            let point = decompress(member)?;
            let c = Scalar::random(&mut OsRng);
            let r = Scalar::random(&mut OsRng);
            parts[i] = (c, r);
            challenge_sum += c;
            (
                EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &point, &r),
                EdwardsPoint::vartime_multiscalar_mul([&r, &c], [&base, &image_point]),
            )
        };

        hasher.update(commitment_g.compress().as_bytes());
        hasher.update(commitment_h.compress().as_bytes());
    }

    let challenge = Scalar::from_hash(hasher);
    let real_c = challenge - challenge_sum;
    parts[real_index] = (real_c, k - real_c * x);

    Ok(parts.iter().map(|(c, r)| join_signature(c, r)).collect())
}

pub fn check_ring_signature(
    prefix_hash: &Hash256,
    key_image: &KeyImage,
    ring: &[PublicKey],
    signatures: &[Signature],
) -> bool {
    if ring.is_empty() || ring.len() != signatures.len() {
        return false;
    }

    let Ok(image_point) = decompress_key_image(key_image) else {
        return false;
    };

    let mut hasher = Keccak512::new();
    hasher.update(prefix_hash.as_bytes());
    let mut challenge_sum = Scalar::ZERO;

    for (member, signature) in ring.iter().zip(signatures) {
        let Ok(point) = decompress(member) else {
            return false;
        };
        let (c, r) = split_signature(signature);
        let base = hash_to_point(member);

        let commitment_g = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &point, &r);
        let commitment_h =
            EdwardsPoint::vartime_multiscalar_mul([&r, &c], [&base, &image_point]);

        hasher.update(commitment_g.compress().as_bytes());
        hasher.update(commitment_h.compress().as_bytes());
        challenge_sum += c;
    }

    Scalar::from_hash(hasher) == challenge_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{generate_key_image, generate_keys};

    #[test]
    fn signature_roundtrip() {
        let keys = generate_keys();
        let hash = Hash256::hash_from_slice(b"prefix");
        let sig = generate_signature(&hash, &keys.public_key, &keys.secret_key);

        assert!(check_signature(&hash, &keys.public_key, &sig));
        assert!(!check_signature(
            &Hash256::hash_from_slice(b"other"),
            &keys.public_key,
            &sig
        ));
        assert!(!check_signature(
            &hash,
            &generate_keys().public_key,
            &sig
        ));
    }

    #[test]
    fn ring_signature_roundtrip() {
        let hash = Hash256::hash_from_slice(b"prefix");

        for real_index in 0..4 {
            let signer = generate_keys();
            let image = generate_key_image(&signer.public_key, &signer.secret_key);

            let mut ring: Vec<PublicKey> = (0..4).map(|_| generate_keys().public_key).collect();
            ring[real_index] = signer.public_key;

            let sigs =
                generate_ring_signature(&hash, &image, &ring, &signer.secret_key, real_index)
                    .unwrap();

            assert!(check_ring_signature(&hash, &image, &ring, &sigs));
            assert!(!check_ring_signature(
                &Hash256::hash_from_slice(b"other"),
                &image,
                &ring,
                &sigs
            ));
        }
    }

    #[test]
    fn ring_signature_rejects_wrong_image() {
        let hash = Hash256::hash_from_slice(b"prefix");
        let signer = generate_keys();
        let image = generate_key_image(&signer.public_key, &signer.secret_key);
        let ring = vec![signer.public_key, generate_keys().public_key];

        let sigs = generate_ring_signature(&hash, &image, &ring, &signer.secret_key, 0).unwrap();

        let other = generate_keys();
        let wrong_image = generate_key_image(&other.public_key, &other.secret_key);
        assert!(!check_ring_signature(&hash, &wrong_image, &ring, &sigs));
    }

    #[test]
    fn ring_index_out_of_range() {
        let hash = Hash256::hash_from_slice(b"prefix");
        let signer = generate_keys();
        let image = generate_key_image(&signer.public_key, &signer.secret_key);
        let ring = vec![signer.public_key];

        assert_eq!(
            generate_ring_signature(&hash, &image, &ring, &signer.secret_key, 1),
            Err(KeyError::InvalidRingIndex)
        );
    }
}
