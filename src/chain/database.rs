use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use secp256k1::PublicKey;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::chain::block::{Block, BlockData, BlockError};
use crate::chain::genesis::Genesis;
use crate::chain::signature;
use crate::chain::storage::{Storage, StorageError};
use crate::chain::transaction::BlockTx;
use crate::chain::EventHandler;

#[derive(Debug, Error)]
#[error("account id is not in a valid 0x hex format")]
pub struct InvalidAccountId;

/// A 20-byte account identifier, the low 20 bytes of the Keccak-256 of an
/// uncompressed secp256k1 public key. Rendered as a lowercase 0x-prefixed
/// 42-char hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AccountId([u8; 20]);

impl AccountId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for AccountId {
    type Err = InvalidAccountId;

    // Accepts 0x + 40 hex chars, case-insensitive, normalized to the
    // canonical lowercase form by virtue of storing raw bytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix("0x").ok_or(InvalidAccountId)?;
        if hex_part.len() != 40 {
            return Err(InvalidAccountId);
        }
        let bytes = hex::decode(hex_part).map_err(|_| InvalidAccountId)?;
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(AccountId(id))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({self})")
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AccountIdVisitor;

        impl<'de> Visitor<'de> for AccountIdVisitor {
            type Value = AccountId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 0x-prefixed 40-char hex account id")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<AccountId, E> {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(AccountIdVisitor)
    }
}

/// Derives the account id from a public key, matching Ethereum address
/// derivation.
pub fn public_key_to_account_id(public_key: &PublicKey) -> AccountId {
    let uncompressed = public_key.serialize_uncompressed();

    let mut hasher = Keccak256::new();
    hasher.update(&uncompressed[1..]);
    let digest = hasher.finalize();

    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[12..]);
    AccountId(id)
}

/// Information stored for an individual account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub nonce: u64,
    pub balance: u64,
}

impl Account {
    fn new(account_id: AccountId, balance: u64) -> Self {
        Self {
            account_id,
            nonce: 0,
            balance,
        }
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),
    #[error("transaction invalid, wrong nonce, got {got}, exp {want}")]
    BadNonce { got: u64, want: u64 },
    #[error("account {account} insufficient balance, balance {balance}, needed {needed}")]
    InsufficientFunds {
        account: AccountId,
        balance: u64,
        needed: u64,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// In-memory authoritative balance and nonce state, plus access to the
/// persisted block log. Readers take the shared lock; the state hash is
/// computed after the lock is released.
pub struct AccountDb {
    storage: Arc<dyn Storage>,
    accounts: RwLock<HashMap<AccountId, Account>>,
    latest_block: RwLock<Block>,
    ev: EventHandler,
}

impl AccountDb {
    /// Seeds accounts from the genesis balance sheet and replays any blocks
    /// already present in storage to rebuild the running state.
    pub fn new(
        genesis: &Genesis,
        storage: Arc<dyn Storage>,
        ev: EventHandler,
    ) -> Result<Self, DatabaseError> {
        let mut accounts = HashMap::with_capacity(genesis.balances.len());
        for (&account_id, &balance) in &genesis.balances {
            accounts.insert(account_id, Account::new(account_id, balance));
            ev(&format!(
                "chain: accountdb: seeded account[{account_id}] balance[{balance}]"
            ));
        }

        let db = Self {
            storage,
            accounts: RwLock::new(accounts),
            latest_block: RwLock::new(Block::genesis()),
            ev,
        };

        for data in db.storage.for_each() {
            let block = data?.to_block()?;
            db.ev(&format!(
                "chain: accountdb: replaying block[{}]",
                block.header.number
            ));

            for tx in block.merkle_tree.values() {
                if let Err(err) = db.apply_transaction(&block, tx) {
                    db.ev(&format!("chain: accountdb: replay: WARNING: {err}"));
                }
            }
            db.apply_mining_reward(&block);
            db.update_latest_block(block);
        }

        Ok(db)
    }

    fn ev(&self, msg: &str) {
        (self.ev)(msg)
    }

    pub fn query(&self, account_id: AccountId) -> Result<Account, DatabaseError> {
        let accounts = self.accounts.read().unwrap();
        accounts
            .get(&account_id)
            .copied()
            .ok_or(DatabaseError::AccountNotFound(account_id))
    }

    /// A deep snapshot of every account.
    pub fn copy(&self) -> HashMap<AccountId, Account> {
        self.accounts.read().unwrap().clone()
    }

    pub fn remove(&self, account_id: AccountId) {
        self.accounts.write().unwrap().remove(&account_id);
    }

    /// The deterministic hash over the full account state: accounts sorted
    /// by id, hashed as canonical JSON. Identical (id, nonce, balance) sets
    /// hash identically regardless of insertion order.
    pub fn hash_state(&self) -> String {
        let mut accounts: Vec<Account> = {
            let guard = self.accounts.read().unwrap();
            guard.values().copied().collect()
        };

        accounts.sort_by_key(|account| account.account_id);
        signature::hash(&accounts)
    }

    /// Credits the beneficiary with the block's mining reward.
    pub fn apply_mining_reward(&self, block: &Block) {
        let beneficiary_id = block.header.beneficiary_id;
        let reward = block.header.mining_reward;

        let mut accounts = self.accounts.write().unwrap();
        let beneficiary = accounts
            .entry(beneficiary_id)
            .or_insert_with(|| Account::new(beneficiary_id, 0));
        beneficiary.balance += reward;

        self.ev(&format!(
            "chain: accountdb: mining reward[{reward}] applied to account[{beneficiary_id}]"
        ));
    }

    /// Applies a transaction's balance changes. The gas fee, clamped to the
    /// sender's balance, is collected even when the nonce or balance checks
    /// fail afterwards; a spammer pays for the attempt.
    pub fn apply_transaction(&self, block: &Block, tx: &BlockTx) -> Result<(), DatabaseError> {
        let from_id = tx.from_id();
        let to_id = tx.to_id();
        let beneficiary_id = block.header.beneficiary_id;

        // Each movement is its own lookup so a sender doubling as the
        // beneficiary still nets out correctly.
        fn adjust(
            accounts: &mut HashMap<AccountId, Account>,
            id: AccountId,
            f: impl FnOnce(&mut Account),
        ) {
            f(accounts.entry(id).or_insert_with(|| Account::new(id, 0)))
        }

        let mut accounts = self.accounts.write().unwrap();
        for id in [from_id, to_id, beneficiary_id] {
            accounts.entry(id).or_insert_with(|| Account::new(id, 0));
        }

        let gas_fee = (tx.gas_price * tx.gas_units).min(accounts[&from_id].balance);
        adjust(&mut accounts, from_id, |a| a.balance -= gas_fee);
        adjust(&mut accounts, beneficiary_id, |a| a.balance += gas_fee);

        let from = accounts[&from_id];
        if tx.nonce() != from.nonce + 1 {
            return Err(DatabaseError::BadNonce {
                got: tx.nonce(),
                want: from.nonce + 1,
            });
        }

        let needed = tx.value() + tx.tip();
        if from.balance < needed {
            return Err(DatabaseError::InsufficientFunds {
                account: from_id,
                balance: from.balance,
                needed,
            });
        }

        adjust(&mut accounts, from_id, |a| a.balance -= tx.value());
        adjust(&mut accounts, to_id, |a| a.balance += tx.value());

        adjust(&mut accounts, from_id, |a| a.balance -= tx.tip());
        adjust(&mut accounts, beneficiary_id, |a| a.balance += tx.tip());

        adjust(&mut accounts, from_id, |a| a.nonce = tx.nonce());

        Ok(())
    }

    pub fn latest_block(&self) -> Block {
        self.latest_block.read().unwrap().clone()
    }

    pub fn update_latest_block(&self, block: Block) {
        *self.latest_block.write().unwrap() = block;
    }

    /// Persists the block to the underlying log.
    pub fn write(&self, block: &Block) -> Result<(), DatabaseError> {
        self.storage.write(&BlockData::from(block))?;
        Ok(())
    }

    pub fn get_block(&self, number: u64) -> Result<Block, DatabaseError> {
        Ok(self.storage.get_block(number)?.to_block()?)
    }

    pub fn for_each(&self) -> Box<dyn Iterator<Item = Result<BlockData, StorageError>>> {
        self.storage.for_each()
    }

    pub fn close(&self) -> Result<(), DatabaseError> {
        self.storage.close()?;
        Ok(())
    }
}
