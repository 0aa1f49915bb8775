use lazy_static::lazy_static;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::Serialize;
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Offset added to the recovery id so signatures produced here are never
/// valid on Ethereum (which uses 27) or any other chain.
pub const CHAIN_STAMP_ID: u8 = 29;

/// Hash value of an empty or zero state, 66 chars with the 0x prefix.
pub const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

lazy_static! {
    /// secp256k1 group order, the exclusive upper bound for valid R/S values.
    static ref CURVE_N: BigUint = BigUint::from_bytes_be(&secp256k1::constants::CURVE_ORDER);
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("marshaling value for signing: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ecdsa rejected the operation: {0}")]
    Ecdsa(#[from] secp256k1::Error),
    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u64),
    #[error("invalid signature values")]
    InvalidSignatureValues,
}

/// Hashes the canonical JSON of any serializable value with Keccak-256 and
/// returns the 0x-prefixed hex string. Block headers and the account state
/// are committed with this exact encoding.
pub fn hash<T: Serialize>(value: &T) -> String {
    let data = match serde_json::to_vec(value) {
        Ok(data) => data,
        Err(_) => return ZERO_HASH.to_string(),
    };

    let mut hasher = Keccak256::new();
    hasher.update(&data);
    format!("0x{}", hex::encode(hasher.finalize()))
}

// The stamp makes the digest unique to this chain: any wallet signing the
// same payload for another network produces a different hash.
fn stamp<T: Serialize>(value: &T) -> Result<[u8; 32], SignatureError> {
    let v = serde_json::to_vec(value)?;

    let stamp = format!("\x19Ardan Signed Message:\n{}", v.len());

    let mut hasher = Keccak256::new();
    hasher.update(stamp.as_bytes());
    hasher.update(&v);

    Ok(hasher.finalize().into())
}

/// Signs the value with the private key and returns the (V, R, S) signature
/// components. V carries the recovery id offset by [`CHAIN_STAMP_ID`].
pub fn sign<T: Serialize>(
    value: &T,
    private_key: &SecretKey,
) -> Result<(BigUint, BigUint, BigUint), SignatureError> {
    let digest = stamp(value)?;

    let sig = SECP256K1.sign_ecdsa_recoverable(&Message::from_digest(digest), private_key);
    let (recovery_id, compact) = sig.serialize_compact();

    // Make sure the produced signature recovers our own public key before
    // handing it out.
    let public_key = private_key.public_key(&SECP256K1);
    let recovered = SECP256K1.recover_ecdsa(&Message::from_digest(digest), &sig)?;
    if recovered != public_key {
        return Err(SignatureError::InvalidSignatureValues);
    }

    let v = BigUint::from(recovery_id.to_i32() as u8 + CHAIN_STAMP_ID);
    let r = BigUint::from_bytes_be(&compact[..32]);
    let s = BigUint::from_bytes_be(&compact[32..64]);

    Ok((v, r, s))
}

/// Checks the signature components are usable: the recovery id must be ours
/// and R/S must lie inside the curve order.
pub fn verify_signature(v: &BigUint, r: &BigUint, s: &BigUint) -> Result<(), SignatureError> {
    recovery_id(v)?;

    let one = BigUint::one();
    if r < &one || r >= &*CURVE_N || s < &one || s >= &*CURVE_N {
        return Err(SignatureError::InvalidSignatureValues);
    }

    Ok(())
}

/// Recovers the signing account's address from the value and signature.
pub fn from_address<T: Serialize>(
    value: &T,
    v: &BigUint,
    r: &BigUint,
    s: &BigUint,
) -> Result<String, SignatureError> {
    let digest = stamp(value)?;

    let mut compact = [0u8; 64];
    copy_be(&mut compact[..32], r);
    copy_be(&mut compact[32..], s);

    let recovery_id = RecoveryId::from_i32(recovery_id(v)? as i32)?;
    let sig = RecoverableSignature::from_compact(&compact, recovery_id)?;

    let public_key = SECP256K1.recover_ecdsa(&Message::from_digest(digest), &sig)?;

    Ok(public_key_to_address(&public_key))
}

/// Derives the 0x-prefixed 20-byte account address from a public key, the
/// low 20 bytes of the Keccak-256 of the uncompressed point.
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();

    let mut hasher = Keccak256::new();
    hasher.update(&uncompressed[1..]);
    let digest = hasher.finalize();

    format!("0x{}", hex::encode(&digest[12..]))
}

/// Renders the 65-byte signature as 0x-prefixed hex, keeping V in its
/// chain-distinguishing form.
pub fn signature_string(v: &BigUint, r: &BigUint, s: &BigUint) -> String {
    let mut buf = [0u8; 65];
    copy_be(&mut buf[..32], r);
    copy_be(&mut buf[32..64], s);
    buf[64] = v.iter_u64_digits().next().unwrap_or(0) as u8;

    format!("0x{}", hex::encode(buf))
}

// The recovery id is V minus the chain offset and must be 0 or 1.
fn recovery_id(v: &BigUint) -> Result<u8, SignatureError> {
    let v = v.to_u64().ok_or(SignatureError::InvalidRecoveryId(u64::MAX))?;
    match v.checked_sub(CHAIN_STAMP_ID as u64) {
        Some(id @ 0..=1) => Ok(id as u8),
        _ => Err(SignatureError::InvalidRecoveryId(v)),
    }
}

// Writes the big-endian bytes of the value right-aligned into the buffer.
fn copy_be(buf: &mut [u8], value: &BigUint) {
    let bytes = value.to_bytes_be();
    let len = bytes.len().min(buf.len());
    let start = buf.len() - len;
    buf[start..].copy_from_slice(&bytes[bytes.len() - len..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use secp256k1::rand::rngs::OsRng;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        name: String,
        value: u64,
    }

    fn keypair() -> (SecretKey, PublicKey) {
        SECP256K1.generate_keypair(&mut OsRng)
    }

    #[test]
    fn sign_then_recover_round_trips_to_the_signer_address() {
        let (sk, pk) = keypair();
        let payload = Payload {
            name: "transfer".to_string(),
            value: 42,
        };

        let (v, r, s) = sign(&payload, &sk).unwrap();
        let recovered = from_address(&payload, &v, &r, &s).unwrap();

        assert_eq!(recovered, public_key_to_address(&pk));
        assert!(recovered.starts_with("0x"));
        assert_eq!(recovered.len(), 42);
    }

    #[test]
    fn distinct_payloads_recover_the_same_signer() {
        let (sk, pk) = keypair();
        let a = Payload {
            name: "a".to_string(),
            value: 1,
        };
        let b = Payload {
            name: "b".to_string(),
            value: 2,
        };

        let (av, ar, asig) = sign(&a, &sk).unwrap();
        let (bv, br, bs) = sign(&b, &sk).unwrap();

        let addr = public_key_to_address(&pk);
        assert_eq!(from_address(&a, &av, &ar, &asig).unwrap(), addr);
        assert_eq!(from_address(&b, &bv, &br, &bs).unwrap(), addr);
    }

    #[test]
    fn tampered_payload_recovers_a_different_address() {
        let (sk, pk) = keypair();
        let payload = Payload {
            name: "transfer".to_string(),
            value: 42,
        };
        let (v, r, s) = sign(&payload, &sk).unwrap();

        let tampered = Payload {
            name: "transfer".to_string(),
            value: 43,
        };
        let recovered = from_address(&tampered, &v, &r, &s);
        match recovered {
            Ok(addr) => assert_ne!(addr, public_key_to_address(&pk)),
            Err(_) => {}
        }
    }

    #[test]
    fn verify_rejects_bad_recovery_id() {
        let r = BigUint::from(1u8);
        let s = BigUint::from(1u8);

        assert!(verify_signature(&BigUint::from(29u8), &r, &s).is_ok());
        assert!(verify_signature(&BigUint::from(30u8), &r, &s).is_ok());
        assert!(verify_signature(&BigUint::from(27u8), &r, &s).is_err());
        assert!(verify_signature(&BigUint::from(31u8), &r, &s).is_err());
    }

    #[test]
    fn verify_rejects_out_of_range_values() {
        let v = BigUint::from(29u8);
        let zero = BigUint::from(0u8);
        let one = BigUint::from(1u8);
        let order = BigUint::from_bytes_be(&secp256k1::constants::CURVE_ORDER);

        assert!(verify_signature(&v, &zero, &one).is_err());
        assert!(verify_signature(&v, &one, &zero).is_err());
        assert!(verify_signature(&v, &order, &one).is_err());
        assert!(verify_signature(&v, &one, &one).is_ok());
    }

    #[test]
    fn signature_string_is_130_hex_chars() {
        let (sk, _) = keypair();
        let payload = Payload {
            name: "x".to_string(),
            value: 0,
        };
        let (v, r, s) = sign(&payload, &sk).unwrap();

        let sig = signature_string(&v, &r, &s);
        assert_eq!(sig.len(), 132);
        assert!(sig.starts_with("0x"));
    }

    #[test]
    fn hash_is_deterministic() {
        let payload = Payload {
            name: "same".to_string(),
            value: 7,
        };
        assert_eq!(hash(&payload), hash(&payload));
        assert_eq!(hash(&payload).len(), 66);
    }
}
