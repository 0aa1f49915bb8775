use serde::Serialize;
use sha3::{Digest, Keccak256};

use crate::chain::signature;

/// Binary Merkle tree over an ordered list of values. Leaves are labeled
/// with the Keccak-256 of each value's canonical JSON; internal nodes hash
/// the concatenation of their children. The tree is immutable once built
/// and keeps the original value ordering.
#[derive(Debug, Clone)]
pub struct Tree<T> {
    root: [u8; 32],
    values: Vec<T>,
}

impl<T: Serialize + Clone> Tree<T> {
    pub fn empty() -> Self {
        Self {
            root: [0u8; 32],
            values: Vec::new(),
        }
    }

    pub fn new(values: Vec<T>) -> Result<Self, serde_json::Error> {
        if values.is_empty() {
            return Ok(Self::empty());
        }

        let mut level: Vec<[u8; 32]> = Vec::with_capacity(values.len());
        for value in &values {
            let data = serde_json::to_vec(value)?;
            level.push(leaf_hash(&data));
        }

        while level.len() > 1 {
            // An odd node count duplicates the trailing node so every parent
            // has two children.
            if level.len() % 2 != 0 {
                level.push(*level.last().unwrap());
            }

            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(node_hash(&pair[0], &pair[1]));
            }
            level = next;
        }

        Ok(Self {
            root: level[0],
            values,
        })
    }

    /// The root as a 0x-prefixed hex string. An empty tree reports the
    /// zero hash.
    pub fn root_hex(&self) -> String {
        if self.values.is_empty() {
            return signature::ZERO_HASH.to_string();
        }
        format!("0x{}", hex::encode(self.root))
    }

    /// The values in their original insertion order.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
