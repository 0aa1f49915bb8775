use std::fmt;

use chrono::Utc;
use num_bigint::BigUint;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::database::{AccountId, InvalidAccountId};
use crate::chain::signature::{self, SignatureError};

#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction invalid, wrong chain id, got {got}, exp {want}")]
    WrongChainId { got: u16, want: u16 },
    #[error("transaction invalid, sending money to yourself")]
    SelfTransfer,
    #[error(transparent)]
    InvalidAccountId(#[from] InvalidAccountId),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("signature address doesn't match from address, got {got}, exp {want}")]
    AddressMismatch { got: String, want: String },
}

/// The transactional information between two parties before it is signed.
/// Field order is canonical: the signing digest hashes this exact JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub chain_id: u16,
    pub nonce: u64,
    #[serde(rename = "from")]
    pub from_id: AccountId,
    #[serde(rename = "to")]
    pub to_id: AccountId,
    pub value: u64,
    pub tip: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Tx {
    pub fn new(
        chain_id: u16,
        nonce: u64,
        from_id: AccountId,
        to_id: AccountId,
        value: u64,
        tip: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            chain_id,
            nonce,
            from_id,
            to_id,
            value,
            tip,
            data,
        }
    }

    /// Signs the transaction, producing the wallet-side record a node will
    /// accept for inclusion.
    pub fn sign(self, private_key: &SecretKey) -> Result<SignedTx, TxError> {
        let (v, r, s) = signature::sign(&self, private_key)?;

        Ok(SignedTx {
            tx: self,
            v,
            r,
            s,
        })
    }
}

/// A signed transaction as submitted by wallets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    #[serde(flatten)]
    pub tx: Tx,
    #[serde(with = "biguint_decimal")]
    pub v: BigUint,
    #[serde(with = "biguint_decimal")]
    pub r: BigUint,
    #[serde(with = "biguint_decimal")]
    pub s: BigUint,
}

impl SignedTx {
    /// Checks the transaction is structurally sound for this chain and that
    /// the signature recovers the declared sender.
    pub fn validate(&self, chain_id: u16) -> Result<(), TxError> {
        if self.tx.chain_id != chain_id {
            return Err(TxError::WrongChainId {
                got: self.tx.chain_id,
                want: chain_id,
            });
        }

        if self.tx.from_id == self.tx.to_id {
            return Err(TxError::SelfTransfer);
        }

        signature::verify_signature(&self.v, &self.r, &self.s)?;

        let address = signature::from_address(&self.tx, &self.v, &self.r, &self.s)?;
        if address.to_lowercase() != self.tx.from_id.to_string() {
            return Err(TxError::AddressMismatch {
                got: address,
                want: self.tx.from_id.to_string(),
            });
        }

        Ok(())
    }

    pub fn signature_string(&self) -> String {
        signature::signature_string(&self.v, &self.r, &self.s)
    }
}

impl fmt::Display for SignedTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx.from_id, self.tx.nonce)
    }
}

/// The mempool's and block's canonical transaction record: a signed
/// transaction plus the node-assigned arrival time and gas terms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTx {
    #[serde(flatten)]
    pub signed_tx: SignedTx,
    pub timestamp: u64,
    pub gas_price: u64,
    pub gas_units: u64,
}

impl BlockTx {
    pub fn new(signed_tx: SignedTx, gas_price: u64, gas_units: u64) -> Self {
        Self {
            signed_tx,
            timestamp: Utc::now().timestamp_millis() as u64,
            gas_price,
            gas_units,
        }
    }

    pub fn from_id(&self) -> AccountId {
        self.signed_tx.tx.from_id
    }

    pub fn to_id(&self) -> AccountId {
        self.signed_tx.tx.to_id
    }

    pub fn nonce(&self) -> u64 {
        self.signed_tx.tx.nonce
    }

    pub fn value(&self) -> u64 {
        self.signed_tx.tx.value
    }

    pub fn tip(&self) -> u64 {
        self.signed_tx.tx.tip
    }
}

impl fmt::Display for BlockTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} val[{}] tip[{}]",
            self.from_id(),
            self.nonce(),
            self.to_id(),
            self.value(),
            self.tip()
        )
    }
}

/// V, R and S travel as decimal big-integer strings so arbitrary precision
/// survives any JSON parser; plain JSON numbers are accepted on the way in.
mod biguint_decimal {
    use num_bigint::BigUint;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        deserializer.deserialize_any(BigUintVisitor)
    }

    struct BigUintVisitor;

    impl<'de> Visitor<'de> for BigUintVisitor {
        type Value = BigUint;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a decimal string or unsigned integer")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<BigUint, E> {
            BigUint::from_str(value).map_err(de::Error::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<BigUint, E> {
            Ok(BigUint::from(value))
        }

        fn visit_u128<E: de::Error>(self, value: u128) -> Result<BigUint, E> {
            Ok(BigUint::from(value))
        }
    }
}

/// Byte payloads travel base64 encoded, matching the wallet wire format.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(Base64Visitor)
    }

    struct Base64Visitor;

    impl<'de> Visitor<'de> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a base64 string")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Vec<u8>, E> {
            STANDARD.decode(value).map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }
    }
}
