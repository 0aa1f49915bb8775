use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::database::AccountId;
use crate::chain::merkle;
use crate::chain::signature;
use crate::chain::transaction::BlockTx;
use crate::chain::EventHandler;

#[derive(Debug, Error)]
pub enum BlockError {
    /// A peer's chain is two or more blocks ahead of ours. Not a plain
    /// validation failure: the caller must pause mining and resync.
    #[error("blockchain forked, start resync")]
    ChainForked,
    #[error("block difficulty is less than parent block difficulty, parent {parent}, block {got}")]
    DifficultyRegression { parent: u16, got: u16 },
    #[error("{0} invalid block hash")]
    UnsolvedHash(String),
    #[error("this block is not the next number, got {got}, exp {want}")]
    WrongNumber { got: u64, want: u64 },
    #[error("parent block hash doesn't match our known parent, got {got}, exp {want}")]
    WrongParentHash { got: String, want: String },
    #[error("block timestamp is before parent block, parent {parent}, block {got}")]
    TimestampRegression { parent: u64, got: u64 },
    #[error("state of the accounts are wrong, current {current}, expected {expected}")]
    StateRootMismatch { current: String, expected: String },
    #[error("merkle root does not match transactions, got {got}, exp {want}")]
    TransRootMismatch { got: String, want: String },
    #[error("mining cancelled")]
    Cancelled,
    #[error("building merkle tree: {0}")]
    Merkle(#[from] serde_json::Error),
}

/// Common information carried by every block. Hashing covers the header
/// only, so the chain can be verified from headers alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub prev_block_hash: String,
    pub timestamp: u64,
    #[serde(rename = "beneficiary")]
    pub beneficiary_id: AccountId,
    pub difficulty: u16,
    pub mining_reward: u64,
    pub state_root: String,
    pub trans_root: String,
    pub nonce: u64,
}

/// A group of transactions batched together behind a mined header.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub merkle_tree: merkle::Tree<BlockTx>,
}

/// What is serialized to disk and over the network for a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: String,
    #[serde(rename = "block")]
    pub header: BlockHeader,
    pub trans: Vec<BlockTx>,
}

impl From<&Block> for BlockData {
    fn from(block: &Block) -> Self {
        Self {
            hash: block.hash(),
            header: block.header.clone(),
            trans: block.merkle_tree.values().to_vec(),
        }
    }
}

impl BlockData {
    /// Rebuilds the full block, reconstructing the merkle tree from the
    /// stored transactions.
    pub fn to_block(&self) -> Result<Block, BlockError> {
        let tree = merkle::Tree::new(self.trans.clone())?;
        Ok(Block {
            header: self.header.clone(),
            merkle_tree: tree,
        })
    }
}

/// Arguments required to run the proof of work operation.
pub struct PowArgs {
    pub beneficiary_id: AccountId,
    pub difficulty: u16,
    pub mining_reward: u64,
    pub prev_block: Block,
    pub state_root: String,
    pub trans: Vec<BlockTx>,
    pub ev: EventHandler,
}

/// Constructs the next block and performs the work of finding a nonce that
/// solves the POW puzzle. Checks the cancel flag on every attempt.
pub fn pow(args: PowArgs, cancel: &AtomicBool) -> Result<Block, BlockError> {
    // When mining the first block the previous block's hash is zero.
    let prev_block_hash = if args.prev_block.header.number == 0 {
        signature::ZERO_HASH.to_string()
    } else {
        args.prev_block.hash()
    };

    let tree = merkle::Tree::new(args.trans)?;
    let trans_root = tree.root_hex();

    let mut block = Block {
        header: BlockHeader {
            number: args.prev_block.header.number + 1,
            prev_block_hash,
            timestamp: Utc::now().timestamp_millis() as u64,
            beneficiary_id: args.beneficiary_id,
            difficulty: args.difficulty,
            mining_reward: args.mining_reward,
            state_root: args.state_root,
            trans_root,
            nonce: 0,
        },
        merkle_tree: tree,
    };

    perform_pow(&mut block, &args.ev, cancel)?;

    Ok(block)
}

fn perform_pow(block: &mut Block, ev: &EventHandler, cancel: &AtomicBool) -> Result<(), BlockError> {
    ev("chain: perform_pow: mining: started");

    for tx in block.merkle_tree.values() {
        ev(&format!("chain: perform_pow: mining: tx[{tx}]"));
    }

    // Random starting point; from here the nonce is incremented by one until
    // a solution is found by us or another node.
    block.header.nonce = OsRng.gen_range(0..1u64 << 63);

    ev("viewer: perform_pow: mining: running");

    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        if attempts % 1_000_000 == 0 {
            ev(&format!(
                "viewer: perform_pow: mining: running: attempts[{attempts}]"
            ));
        }

        if cancel.load(Ordering::Relaxed) {
            ev("chain: perform_pow: mining: cancelled");
            return Err(BlockError::Cancelled);
        }

        let hash = block.hash();
        if !is_hash_solved(block.header.difficulty, &hash) {
            block.header.nonce = block.header.nonce.wrapping_add(1);
            continue;
        }

        ev(&format!(
            "chain: perform_pow: mining: solved: prev[{}]: new[{}]",
            block.header.prev_block_hash, hash
        ));
        ev(&format!("chain: perform_pow: mining: attempts[{attempts}]"));
        ev("chain: perform_pow: mining: completed");

        return Ok(());
    }
}

impl Block {
    /// The unique hash for the block, computed over the header only.
    /// Block zero hashes to the zero hash sentinel.
    pub fn hash(&self) -> String {
        if self.header.number == 0 {
            return signature::ZERO_HASH.to_string();
        }
        signature::hash(&self.header)
    }

    /// An empty block zero to anchor the chain before any block is mined.
    pub fn genesis() -> Self {
        Self {
            header: BlockHeader {
                number: 0,
                prev_block_hash: signature::ZERO_HASH.to_string(),
                timestamp: 0,
                beneficiary_id: AccountId::default(),
                difficulty: 0,
                mining_reward: 0,
                state_root: String::new(),
                trans_root: String::new(),
                nonce: 0,
            },
            merkle_tree: merkle::Tree::empty(),
        }
    }

    /// Validates this block for inclusion on top of the previous block.
    pub fn validate(
        &self,
        previous: &Block,
        state_root: &str,
        ev: &EventHandler,
    ) -> Result<(), BlockError> {
        let number = self.header.number;
        ev(&format!(
            "chain: validate: blk[{number}]: check: chain is not forked"
        ));

        // The sender of this block is two or more blocks ahead of us. There
        // has been a fork and we are on the wrong side.
        let next_number = previous.header.number + 1;
        if number >= next_number + 2 {
            return Err(BlockError::ChainForked);
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: difficulty is the same or greater than parent"
        ));

        if self.header.difficulty < previous.header.difficulty {
            return Err(BlockError::DifficultyRegression {
                parent: previous.header.difficulty,
                got: self.header.difficulty,
            });
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: hash has been solved"
        ));

        let hash = self.hash();
        if !is_hash_solved(self.header.difficulty, &hash) {
            return Err(BlockError::UnsolvedHash(hash));
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: number is the next number"
        ));

        if number != next_number {
            return Err(BlockError::WrongNumber {
                got: number,
                want: next_number,
            });
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: parent hash matches parent block"
        ));

        if self.header.prev_block_hash != previous.hash() {
            return Err(BlockError::WrongParentHash {
                got: self.header.prev_block_hash.clone(),
                want: previous.hash(),
            });
        }

        if previous.header.timestamp > 0 {
            ev(&format!(
                "chain: validate: blk[{number}]: check: timestamp is not before parent"
            ));

            if self.header.timestamp < previous.header.timestamp {
                return Err(BlockError::TimestampRegression {
                    parent: previous.header.timestamp,
                    got: self.header.timestamp,
                });
            }
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: state root matches database"
        ));

        if self.header.state_root != state_root {
            return Err(BlockError::StateRootMismatch {
                current: state_root.to_string(),
                expected: self.header.state_root.clone(),
            });
        }

        ev(&format!(
            "chain: validate: blk[{number}]: check: merkle root matches transactions"
        ));

        if self.header.trans_root != self.merkle_tree.root_hex() {
            return Err(BlockError::TransRootMismatch {
                got: self.merkle_tree.root_hex(),
                want: self.header.trans_root.clone(),
            });
        }

        Ok(())
    }
}

/// A hash is solved when its first `difficulty` nibbles after the 0x prefix
/// are zero.
pub fn is_hash_solved(difficulty: u16, hash: &str) -> bool {
    const MATCH: &str = "0x00000000000000000";

    if hash.len() != 66 {
        return false;
    }

    let prefix = (difficulty + 2) as usize;
    if prefix > MATCH.len() {
        return false;
    }
    hash[..prefix] == MATCH[..prefix]
}
