use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::str::FromStr;

use dashmap::DashMap;
use thiserror::Error;

use crate::chain::database::AccountId;
use crate::chain::transaction::BlockTx;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("strategy {0:?} does not exist")]
    UnknownStrategy(String),
}

/// How transactions are picked out of the pool for the next block. Both
/// strategies keep each account's transactions in nonce-ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStrategy {
    /// Highest tips first, selected row by row across accounts.
    Tip,
    /// Accounts ordered by their head-of-queue tip, refreshed as
    /// transactions are drained.
    TipAdvanced,
}

impl FromStr for SelectStrategy {
    type Err = MempoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tip" => Ok(SelectStrategy::Tip),
            "tip_advanced" => Ok(SelectStrategy::TipAdvanced),
            other => Err(MempoolError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Concurrent staging area for unmined transactions, keyed by
/// (account, nonce). A later upsert with the same key replaces the earlier
/// transaction, which supports replace-by-fee style updates.
pub struct Mempool {
    pool: DashMap<AccountId, BTreeMap<u64, BlockTx>>,
    strategy: SelectStrategy,
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_strategy(SelectStrategy::Tip)
    }

    pub fn with_strategy(strategy: SelectStrategy) -> Self {
        Self {
            pool: DashMap::new(),
            strategy,
        }
    }

    pub fn new_with_strategy(name: &str) -> Result<Self, MempoolError> {
        Ok(Self::with_strategy(name.parse()?))
    }

    /// Inserts or replaces the transaction stored under (from, nonce).
    pub fn upsert(&self, tx: BlockTx) {
        self.pool
            .entry(tx.from_id())
            .or_default()
            .insert(tx.nonce(), tx);
    }

    /// Removes the transaction stored under (from, nonce); missing entries
    /// are ignored.
    pub fn delete(&self, tx: &BlockTx) {
        let from_id = tx.from_id();
        let mut empty = false;
        if let Some(mut txs) = self.pool.get_mut(&from_id) {
            txs.remove(&tx.nonce());
            empty = txs.is_empty();
        }
        if empty {
            self.pool.remove_if(&from_id, |_, txs| txs.is_empty());
        }
    }

    /// Drops every pending transaction.
    pub fn truncate(&self) {
        self.pool.clear();
    }

    pub fn count(&self) -> usize {
        self.pool.iter().map(|entry| entry.value().len()).sum()
    }

    /// Selects up to `how_many` transactions for the next block following
    /// the configured strategy; 0 selects everything.
    pub fn pick_best(&self, how_many: usize) -> Vec<BlockTx> {
        // Snapshot each account's queue in nonce-ascending order so the
        // selection works on stable data.
        let groups: Vec<Vec<BlockTx>> = self
            .pool
            .iter()
            .map(|entry| entry.value().values().cloned().collect())
            .collect();

        match self.strategy {
            SelectStrategy::Tip => tip_select(groups, how_many),
            SelectStrategy::TipAdvanced => advanced_tip_select(groups, how_many),
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

// Walks the accounts a row at a time (everyone's first pending tx, then
// everyone's second, ...), sorting each row by tip descending. Earlier
// nonces always land in earlier rows, so per-account ordering holds no
// matter where the selection stops.
fn tip_select(groups: Vec<Vec<BlockTx>>, how_many: usize) -> Vec<BlockTx> {
    let total: usize = groups.iter().map(Vec::len).sum();
    let want = if how_many == 0 { total } else { how_many.min(total) };

    let mut final_txs = Vec::with_capacity(want);
    let mut depth = 0;
    while final_txs.len() < want {
        let mut row: Vec<BlockTx> = groups
            .iter()
            .filter_map(|txs| txs.get(depth).cloned())
            .collect();
        if row.is_empty() {
            break;
        }
        row.sort_by(|a, b| b.tip().cmp(&a.tip()));

        for tx in row {
            final_txs.push(tx);
            if final_txs.len() == want {
                break;
            }
        }
        depth += 1;
    }

    final_txs
}

// Keeps a heap of accounts keyed by the tip of their next pending
// transaction. Each pick takes the best head and re-queues the account with
// its refreshed head, so high tips win without ever reordering nonces.
fn advanced_tip_select(groups: Vec<Vec<BlockTx>>, how_many: usize) -> Vec<BlockTx> {
    let total: usize = groups.iter().map(Vec::len).sum();
    let want = if how_many == 0 { total } else { how_many.min(total) };

    let mut queues: Vec<VecDeque<BlockTx>> = groups.into_iter().map(VecDeque::from).collect();

    let mut heap: BinaryHeap<(u64, usize)> = queues
        .iter()
        .enumerate()
        .filter_map(|(i, queue)| queue.front().map(|tx| (tx.tip(), i)))
        .collect();

    let mut final_txs = Vec::with_capacity(want);
    while final_txs.len() < want {
        let Some((_, i)) = heap.pop() else { break };

        if let Some(tx) = queues[i].pop_front() {
            final_txs.push(tx);
        }
        if let Some(next) = queues[i].front() {
            heap.push((next.tip(), i));
        }
    }

    final_txs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::chain::database::public_key_to_account_id;
    use crate::chain::transaction::Tx;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::{SecretKey, SECP256K1};

    struct Signer {
        sk: SecretKey,
        id: AccountId,
    }

    fn signer() -> Signer {
        let (sk, pk) = SECP256K1.generate_keypair(&mut OsRng);
        Signer {
            sk,
            id: public_key_to_account_id(&pk),
        }
    }

    fn tx(signer: &Signer, nonce: u64, tip: u64) -> BlockTx {
        let (_, pk) = SECP256K1.generate_keypair(&mut OsRng);
        let to = public_key_to_account_id(&pk);
        let tx = Tx::new(1, nonce, signer.id, to, 10, tip, Vec::new());
        BlockTx::new(tx.sign(&signer.sk).unwrap(), 1, 1)
    }

    fn nonce_order_per_account(picked: &[BlockTx]) -> bool {
        let mut last: HashMap<AccountId, u64> = HashMap::new();
        picked.iter().all(|tx| {
            let ok = last.get(&tx.from_id()).map_or(true, |&n| tx.nonce() > n);
            last.insert(tx.from_id(), tx.nonce());
            ok
        })
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(matches!(
            Mempool::new_with_strategy("fifo"),
            Err(MempoolError::UnknownStrategy(_))
        ));
        assert!(Mempool::new_with_strategy("TIP").is_ok());
        assert!(Mempool::new_with_strategy("tip_advanced").is_ok());
    }

    #[test]
    fn pick_best_zero_returns_everything() {
        let pool = Mempool::new();
        let a = signer();
        let b = signer();

        pool.upsert(tx(&a, 1, 10));
        pool.upsert(tx(&a, 2, 20));
        pool.upsert(tx(&b, 1, 5));

        assert_eq!(pool.count(), 3);
        assert_eq!(pool.pick_best(0).len(), 3);
    }

    #[test]
    fn upsert_replaces_by_account_and_nonce() {
        let pool = Mempool::new();
        let a = signer();

        pool.upsert(tx(&a, 1, 10));
        pool.upsert(tx(&a, 1, 50));

        let picked = pool.pick_best(0);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].tip(), 50);
    }

    #[test]
    fn delete_removes_by_key_and_tolerates_missing() {
        let pool = Mempool::new();
        let a = signer();

        let first = tx(&a, 1, 10);
        pool.upsert(first.clone());
        pool.delete(&first);
        pool.delete(&first);

        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn truncate_empties_the_pool() {
        let pool = Mempool::new();
        let a = signer();
        pool.upsert(tx(&a, 1, 1));
        pool.upsert(tx(&a, 2, 1));

        pool.truncate();
        assert_eq!(pool.count(), 0);
        assert!(pool.pick_best(0).is_empty());
    }

    #[test]
    fn tip_strategy_keeps_nonce_order_per_account() {
        let pool = Mempool::new();
        let a = signer();
        let b = signer();

        // Higher nonce carries the higher tip; order must still hold.
        pool.upsert(tx(&a, 1, 1));
        pool.upsert(tx(&a, 2, 100));
        pool.upsert(tx(&b, 1, 50));
        pool.upsert(tx(&b, 2, 2));

        let picked = pool.pick_best(0);
        assert_eq!(picked.len(), 4);
        assert!(nonce_order_per_account(&picked));

        // First row is tip sorted: b's 50 beats a's 1.
        assert_eq!(picked[0].tip(), 50);
    }

    #[test]
    fn tip_strategy_honors_the_requested_count() {
        let pool = Mempool::new();
        let a = signer();
        let b = signer();

        pool.upsert(tx(&a, 1, 1));
        pool.upsert(tx(&b, 1, 9));
        pool.upsert(tx(&b, 2, 8));

        let picked = pool.pick_best(2);
        assert_eq!(picked.len(), 2);
        assert!(nonce_order_per_account(&picked));
    }

    #[test]
    fn advanced_strategy_drains_the_best_head_first() {
        let pool = Mempool::new_with_strategy("tip_advanced").unwrap();
        let a = signer();
        let b = signer();

        pool.upsert(tx(&a, 1, 5));
        pool.upsert(tx(&a, 2, 100));
        pool.upsert(tx(&b, 1, 50));

        let picked = pool.pick_best(0);
        assert_eq!(picked.len(), 3);
        assert!(nonce_order_per_account(&picked));

        // b's head tip (50) beats a's head tip (5), even though a holds the
        // single largest tip behind a lower nonce.
        assert_eq!(picked[0].from_id(), b.id);
        assert_eq!(picked[1].from_id(), a.id);
        assert_eq!(picked[1].nonce(), 1);
        assert_eq!(picked[2].nonce(), 2);
    }

    #[test]
    fn concurrent_upserts_are_all_kept() {
        let pool = Arc::new(Mempool::new());
        let signers: Vec<Signer> = (0..4).map(|_| signer()).collect();

        std::thread::scope(|scope| {
            for s in &signers {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for nonce in 1..=25u64 {
                        pool.upsert(tx(s, nonce, nonce));
                    }
                });
            }
        });

        assert_eq!(pool.count(), 100);
        assert_eq!(pool.pick_best(0).len(), 100);
    }
}
