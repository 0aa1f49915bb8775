use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::chain::block::{pow, Block, BlockData, BlockError, PowArgs};
use crate::chain::database::{Account, AccountDb, AccountId, DatabaseError};
use crate::chain::genesis::Genesis;
use crate::chain::mempool::{Mempool, MempoolError};
use crate::chain::storage::Storage;
use crate::chain::transaction::{BlockTx, SignedTx, TxError};
use crate::chain::worker::Worker;
use crate::chain::EventHandler;

#[derive(Debug, Error)]
pub enum StateError {
    /// The mempool is empty; skip this mining cycle.
    #[error("no transactions in mempool")]
    NoTransactions,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error("mining task failed: {0}")]
    MiningTask(String),
}

impl StateError {
    /// True when the error signals a fork: the caller must stop mining and
    /// resynchronize rather than treat this as a plain failure.
    pub fn is_chain_forked(&self) -> bool {
        matches!(self, StateError::Block(BlockError::ChainForked))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StateError::Block(BlockError::Cancelled))
    }
}

/// Configuration required to bring up the chain state.
pub struct Config {
    pub beneficiary_id: AccountId,
    pub genesis: Genesis,
    pub storage: Arc<dyn Storage>,
    pub select_strategy: String,
    pub ev: Option<EventHandler>,
}

/// The core API for the blockchain: orchestrates the mempool, mining, the
/// account database and the block log.
pub struct State {
    // Serializes block commits end to end so the state hash observed
    // during validation cannot shift under the validator.
    commit: Mutex<()>,
    allow_mining: AtomicBool,

    beneficiary_id: AccountId,
    ev: EventHandler,

    genesis: Genesis,
    mempool: Mempool,
    db: AccountDb,

    worker: OnceLock<Arc<Worker>>,
}

impl State {
    pub fn new(cfg: Config) -> Result<Arc<Self>, StateError> {
        let ev: EventHandler = cfg.ev.unwrap_or_else(|| Arc::new(|_: &str| {}));

        let db = AccountDb::new(&cfg.genesis, cfg.storage, Arc::clone(&ev))?;
        let mempool = Mempool::new_with_strategy(&cfg.select_strategy)?;

        Ok(Arc::new(Self {
            commit: Mutex::new(()),
            allow_mining: AtomicBool::new(true),
            beneficiary_id: cfg.beneficiary_id,
            ev,
            genesis: cfg.genesis,
            mempool,
            db,
            worker: OnceLock::new(),
        }))
    }

    /// Registers the background worker driving the mining cycles. Called
    /// once by [`Worker::run`].
    pub fn attach_worker(&self, worker: Arc<Worker>) {
        let _ = self.worker.set(worker);
    }

    pub fn worker(&self) -> Option<&Arc<Worker>> {
        self.worker.get()
    }

    /// Accepts a transaction from a wallet for inclusion in a future block.
    ///
    /// The wallet is responsible for balance and nonce hygiene: a
    /// transaction that cannot pay its way when mined still costs its
    /// sender the gas fee.
    pub fn upsert_wallet_transaction(&self, signed_tx: SignedTx) -> Result<(), StateError> {
        signed_tx.validate(self.genesis.chain_id)?;

        const ONE_UNIT_OF_GAS: u64 = 1;
        let tx = BlockTx::new(signed_tx, self.genesis.gas_price, ONE_UNIT_OF_GAS);

        self.mempool.upsert(tx);
        self.ev(&format!(
            "state: upsert_wallet_transaction: mempool[{}]",
            self.mempool.count()
        ));

        if let Some(worker) = self.worker.get() {
            worker.signal_start_mining();
        }

        Ok(())
    }

    /// Attempts to mine the next block from the best pending transactions.
    /// The POW search runs on a blocking thread and honors the cancel flag.
    pub async fn mine_new_block(&self, cancel: Arc<AtomicBool>) -> Result<Block, StateError> {
        self.ev("state: mine_new_block: check mempool count");

        if self.mempool.count() == 0 {
            return Err(StateError::NoTransactions);
        }

        let trans = self.mempool.pick_best(self.genesis.trans_per_block as usize);

        let args = PowArgs {
            beneficiary_id: self.beneficiary_id,
            difficulty: self.genesis.difficulty,
            mining_reward: self.genesis.mining_reward,
            prev_block: self.db.latest_block(),
            state_root: self.db.hash_state(),
            trans,
            ev: Arc::clone(&self.ev),
        };

        let pow_cancel = Arc::clone(&cancel);
        let block = tokio::task::spawn_blocking(move || pow(args, &pow_cancel))
            .await
            .map_err(|err| StateError::MiningTask(err.to_string()))??;

        // One more cancellation check before committing anything.
        if cancel.load(Ordering::Relaxed) {
            return Err(StateError::Block(BlockError::Cancelled));
        }

        self.ev("state: mine_new_block: validate and update database");

        self.validate_update_database(block.clone()).await?;

        Ok(block)
    }

    /// Validates the block against the consensus rules and, if it passes,
    /// commits it: block log, latest block, account balances, mining
    /// reward, mempool eviction.
    pub async fn validate_update_database(&self, block: Block) -> Result<(), StateError> {
        let _guard = self.commit.lock().await;

        self.ev("state: validate_update_database: validate block");

        block.validate(&self.db.latest_block(), &self.db.hash_state(), &self.ev)?;

        self.ev("state: validate_update_database: write to disk");

        self.db.write(&block)?;
        self.db.update_latest_block(block.clone());

        self.ev("state: validate_update_database: update accounts and remove from mempool");

        for tx in block.merkle_tree.values() {
            self.ev(&format!(
                "state: validate_update_database: tx[{tx}] update and remove"
            ));

            self.mempool.delete(tx);

            // A transaction that fails here already paid its clamped gas
            // fee; the rest of the block still applies.
            if let Err(err) = self.db.apply_transaction(&block, tx) {
                self.ev(&format!("state: validate_update_database: WARNING: {err}"));
                continue;
            }
        }

        self.ev("state: validate_update_database: apply mining reward");

        self.db.apply_mining_reward(&block);

        self.block_event(&block);

        Ok(())
    }

    fn block_event(&self, block: &Block) {
        let data = BlockData::from(block);
        let json = serde_json::to_string(&data)
            .unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}"));
        self.ev(&format!("viewer: block: {json}"));
    }

    /// Cleanly brings the node down: stop mining, close the block log.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        self.ev("state: shutdown: started");

        if let Some(worker) = self.worker.get() {
            worker.shutdown().await;
        }
        self.db.close()?;

        self.ev("state: shutdown: completed");
        Ok(())
    }

    fn ev(&self, msg: &str) {
        (self.ev)(msg)
    }

    // ------------------------------------------------------------------
    // Query surface.

    pub fn is_mining_allowed(&self) -> bool {
        self.allow_mining.load(Ordering::Acquire)
    }

    /// Turned off when a fork is detected until a resync brings the chain
    /// back in line.
    pub fn set_mining_allowed(&self, allowed: bool) {
        self.allow_mining.store(allowed, Ordering::Release);
    }

    pub fn accounts(&self) -> HashMap<AccountId, Account> {
        self.db.copy()
    }

    pub fn query_account(&self, account_id: AccountId) -> Result<Account, StateError> {
        Ok(self.db.query(account_id)?)
    }

    pub fn mempool(&self) -> Vec<BlockTx> {
        self.mempool.pick_best(0)
    }

    pub fn mempool_length(&self) -> usize {
        self.mempool.count()
    }

    pub fn latest_block(&self) -> Block {
        self.db.latest_block()
    }

    pub fn get_block(&self, number: u64) -> Result<Block, StateError> {
        Ok(self.db.get_block(number)?)
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use crate::chain::database::public_key_to_account_id;
    use crate::chain::storage::MemoryStorage;
    use crate::chain::transaction::Tx;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::{SecretKey, SECP256K1};

    fn account() -> (SecretKey, AccountId) {
        let (sk, pk) = SECP256K1.generate_keypair(&mut OsRng);
        (sk, public_key_to_account_id(&pk))
    }

    fn new_state(
        beneficiary_id: AccountId,
        balances: StdHashMap<AccountId, u64>,
    ) -> Arc<State> {
        State::new(Config {
            beneficiary_id,
            genesis: Genesis {
                date: String::new(),
                chain_id: 1,
                trans_per_block: 1,
                difficulty: 1,
                mining_reward: 700,
                gas_price: 1,
                balances,
            },
            storage: Arc::new(MemoryStorage::new()),
            select_strategy: "tip".to_string(),
            ev: None,
        })
        .unwrap()
    }

    fn no_cancel() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn submit_and_mine_updates_all_balances() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());

        let tx = Tx::new(1, 1, a, b, 100, 5, Vec::new());
        state.upsert_wallet_transaction(tx.sign(&sk).unwrap()).unwrap();
        assert_eq!(state.mempool_length(), 1);

        let block = state.mine_new_block(no_cancel()).await.unwrap();

        assert_eq!(block.header.number, 1);
        assert_eq!(state.latest_block().header.number, 1);
        assert_eq!(state.mempool_length(), 0);

        assert_eq!(state.query_account(a).unwrap().balance, 1000 - 100 - 5 - 1);
        assert_eq!(state.query_account(a).unwrap().nonce, 1);
        assert_eq!(state.query_account(b).unwrap().balance, 100);
        assert_eq!(
            state.query_account(beneficiary).unwrap().balance,
            700 + 5 + 1
        );
    }

    #[tokio::test]
    async fn mining_consecutive_blocks_links_the_chain() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());

        for nonce in 1..=2u64 {
            let tx = Tx::new(1, nonce, a, b, 10, 1, Vec::new());
            state.upsert_wallet_transaction(tx.sign(&sk).unwrap()).unwrap();
            state.mine_new_block(no_cancel()).await.unwrap();
        }

        let latest = state.latest_block();
        assert_eq!(latest.header.number, 2);
        assert_eq!(
            latest.header.prev_block_hash,
            state.get_block(1).unwrap().hash()
        );
        assert_eq!(state.query_account(a).unwrap().nonce, 2);
    }

    #[tokio::test]
    async fn bad_nonce_transaction_is_mined_but_only_pays_gas() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());

        // Nonce 7 while the account expects 1. Format is valid so the
        // mempool accepts it.
        let tx = Tx::new(1, 7, a, b, 100, 5, Vec::new());
        state.upsert_wallet_transaction(tx.sign(&sk).unwrap()).unwrap();
        assert_eq!(state.mempool_length(), 1);

        state.mine_new_block(no_cancel()).await.unwrap();

        // Removed from the mempool, gas charged, no transfer happened.
        assert_eq!(state.mempool_length(), 0);
        assert_eq!(state.query_account(a).unwrap().balance, 999);
        assert_eq!(state.query_account(a).unwrap().nonce, 0);
        assert!(state.query_account(b).is_err());
    }

    #[tokio::test]
    async fn self_transfers_never_reach_the_mempool() {
        let (sk, a) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());

        let tx = Tx::new(1, 1, a, a, 100, 5, Vec::new());
        let result = state.upsert_wallet_transaction(tx.sign(&sk).unwrap());

        assert!(matches!(result, Err(StateError::Tx(TxError::SelfTransfer))));
        assert_eq!(state.mempool_length(), 0);
    }

    #[tokio::test]
    async fn wrong_chain_transactions_are_rejected() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());

        let tx = Tx::new(2, 1, a, b, 100, 5, Vec::new());
        assert!(state
            .upsert_wallet_transaction(tx.sign(&sk).unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn mining_an_empty_mempool_is_skipped() {
        let (_, beneficiary) = account();
        let state = new_state(beneficiary, StdHashMap::new());

        assert!(matches!(
            state.mine_new_block(no_cancel()).await,
            Err(StateError::NoTransactions)
        ));
    }

    #[tokio::test]
    async fn cancelled_mining_commits_nothing() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 1000)].into_iter().collect());
        let tx = Tx::new(1, 1, a, b, 100, 5, Vec::new());
        state.upsert_wallet_transaction(tx.sign(&sk).unwrap()).unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let result = state.mine_new_block(cancel).await;

        assert!(matches!(result, Err(ref err) if err.is_cancelled()));
        assert_eq!(state.latest_block().header.number, 0);
        assert_eq!(state.mempool_length(), 1);
    }

    #[tokio::test]
    async fn trans_per_block_limits_the_batch() {
        let (sk, a) = account();
        let (_, b) = account();
        let (_, beneficiary) = account();

        let state = new_state(beneficiary, [(a, 10_000)].into_iter().collect());

        for nonce in 1..=3u64 {
            let tx = Tx::new(1, nonce, a, b, 10, 1, Vec::new());
            state.upsert_wallet_transaction(tx.sign(&sk).unwrap()).unwrap();
        }

        // trans_per_block is 1: each block carries one transaction.
        let block = state.mine_new_block(no_cancel()).await.unwrap();
        assert_eq!(block.merkle_tree.len(), 1);
        assert_eq!(state.mempool_length(), 2);
    }
}
