#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]
//! The transaction pool: admission, nonce ordering, fee priority,
//! replacement, timeout eviction and proposal selection.
//!
//! Entries are shared across four coordinated indices (by content hash, by
//! `(source, nonce)`, by priority, by enqueue time). Priority compares the
//! distance of a transaction's nonce from the source's last known applied
//! nonce (closer first), breaking ties by gas price, highest first. Because
//! distance depends on the cached account nonce, a source's priority keys
//! are reindexed whenever that nonce moves.

use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};
use umbra_types::app::{short_hex, Address, Hash32, TransactionEnv};
use umbra_types::codec;
use umbra_types::config::HashType;
use umbra_types::error::PoolError;
use umbra_types::general::TXSET_LIMIT_SIZE;

/// A pool entry: the envelope plus everything the indices key on.
#[derive(Debug)]
pub struct PooledTx {
    pub env: TransactionEnv,
    pub content_hash: Hash32,
    pub source: Address,
    pub nonce: u64,
    pub gas_price: i64,
    pub enqueue_time: i64,
    pub byte_size: usize,
}

impl PooledTx {
    fn from_env(env: TransactionEnv, now: i64, hash_kind: HashType) -> Arc<Self> {
        let content_hash =
            umbra_crypto::digest(hash_kind, &codec::to_bytes_canonical(&env.transaction));
        let byte_size = env.byte_size();
        Arc::new(PooledTx {
            source: env.transaction.source.clone(),
            nonce: env.transaction.nonce,
            gas_price: env.transaction.gas_price,
            enqueue_time: now,
            content_hash,
            byte_size,
            env,
        })
    }
}

/// Priority key: nonce distance ascending, gas price descending, content
/// hash as the final tie break.
type PriorityKey = (i64, Reverse<i64>, Hash32);

#[derive(Default)]
struct PoolInner {
    by_hash: HashMap<Hash32, Arc<PooledTx>>,
    by_account: HashMap<Address, BTreeMap<u64, Arc<PooledTx>>>,
    priority: BTreeSet<PriorityKey>,
    time_index: BTreeSet<(i64, Hash32)>,
    /// Last known applied nonce per source with queued entries.
    account_nonce: HashMap<Address, u64>,
}

impl PoolInner {
    fn priority_key(&self, tx: &PooledTx) -> PriorityKey {
        let base = self.account_nonce.get(&tx.source).copied().unwrap_or(0);
        (
            tx.nonce as i64 - base as i64,
            Reverse(tx.gas_price),
            tx.content_hash,
        )
    }

    fn insert(&mut self, tx: Arc<PooledTx>) {
        let key = self.priority_key(&tx);
        self.priority.insert(key);
        self.time_index.insert((tx.enqueue_time, tx.content_hash));
        self.by_hash.insert(tx.content_hash, tx.clone());
        self.by_account
            .entry(tx.source.clone())
            .or_default()
            .insert(tx.nonce, tx);
    }

    fn remove(&mut self, source: &Address, nonce: u64) -> Option<Arc<PooledTx>> {
        let tx = self.by_account.get_mut(source)?.remove(&nonce)?;

        // The priority key depends on the cached account nonce, so derive it
        // before that cache can go away below.
        let key = self.priority_key(&tx);
        self.priority.remove(&key);
        self.time_index.remove(&(tx.enqueue_time, tx.content_hash));
        self.by_hash.remove(&tx.content_hash);

        if self
            .by_account
            .get(source)
            .map(|account| account.is_empty())
            .unwrap_or(false)
        {
            self.by_account.remove(source);
            self.account_nonce.remove(source);
        }
        Some(tx)
    }

    /// Recompute the priority keys of every entry of `source` after its
    /// cached account nonce moved.
    fn reindex_source(&mut self, source: &Address, old_base: u64) {
        let txs: Vec<Arc<PooledTx>> = match self.by_account.get(source) {
            Some(account) => account.values().cloned().collect(),
            None => return,
        };
        for tx in txs {
            let old_key = (
                tx.nonce as i64 - old_base as i64,
                Reverse(tx.gas_price),
                tx.content_hash,
            );
            self.priority.remove(&old_key);
            let new_key = self.priority_key(&tx);
            self.priority.insert(new_key);
        }
    }

    /// Move the cached nonce for `source`, keeping the priority index
    /// consistent.
    fn set_account_nonce(&mut self, source: &Address, nonce: u64) {
        let old = self.account_nonce.get(source).copied().unwrap_or(0);
        if old == nonce {
            return;
        }
        self.account_nonce.insert(source.clone(), nonce);
        self.reindex_source(source, old);
    }

    fn len(&self) -> usize {
        self.by_hash.len()
    }
}

/// The shared transaction pool. Reads and writes come from both the main
/// consensus context and the RPC workers, hence the read/write lock.
pub struct TxPool {
    inner: RwLock<PoolInner>,
    queue_limit: usize,
    account_txs_limit: usize,
    tx_timeout: i64,
    hash_kind: HashType,
}

impl TxPool {
    pub fn new(
        queue_limit: usize,
        account_txs_limit: usize,
        tx_timeout: i64,
        hash_kind: HashType,
    ) -> Self {
        TxPool {
            inner: RwLock::new(PoolInner::default()),
            queue_limit,
            account_txs_limit,
            tx_timeout,
            hash_kind,
        }
    }

    /// Content hash of an envelope under the pool's digest suite.
    pub fn content_hash(&self, env: &TransactionEnv) -> Hash32 {
        umbra_crypto::digest(
            self.hash_kind,
            &codec::to_bytes_canonical(&env.transaction),
        )
    }

    /// Admit a transaction. `cur_source_nonce` is the source's last applied
    /// nonce as the ledger currently knows it.
    pub fn import(
        &self,
        env: TransactionEnv,
        cur_source_nonce: u64,
        now: i64,
    ) -> Result<(), PoolError> {
        let tx = PooledTx::from_env(env, now, self.hash_kind);
        let mut inner = self.inner.write();

        // An exact duplicate leaves the pool untouched.
        if inner.by_hash.contains_key(&tx.content_hash) {
            return Ok(());
        }

        if tx.nonce <= cur_source_nonce {
            return Err(PoolError::NonceTooLow {
                last_applied: cur_source_nonce,
                got: tx.nonce,
            });
        }

        trace!(
            target: "pool",
            "importing tx source({}) hash({}) nonce({}) gas_price({})",
            tx.source,
            short_hex(&tx.content_hash),
            tx.nonce,
            tx.gas_price
        );
        inner.set_account_nonce(&tx.source, cur_source_nonce);

        let mut replaced = false;
        let mut account_txs_size = inner
            .by_account
            .get(&tx.source)
            .map(|account| account.len())
            .unwrap_or(0);

        let existing = inner
            .by_account
            .get(&tx.source)
            .and_then(|account| account.get(&tx.nonce))
            .cloned();
        if let Some(old) = existing {
            // Same (source, nonce): only a meaningfully better fee replaces
            // the queued entry.
            if (tx.gas_price - old.gas_price) as f64 >= old.gas_price as f64 * 0.1 {
                trace!(
                    target: "pool",
                    "replacing tx hash({}) with hash({}), gas_price {} -> {}",
                    short_hex(&old.content_hash),
                    short_hex(&tx.content_hash),
                    old.gas_price,
                    tx.gas_price
                );
                inner.remove(&tx.source.clone(), tx.nonce);
                inner.set_account_nonce(&tx.source, cur_source_nonce);
                replaced = true;
                account_txs_size = account_txs_size.saturating_sub(1);
            } else {
                debug!(
                    target: "pool",
                    "under-priced replacement dropped, source({}) nonce({}) gas_price({})",
                    tx.source,
                    tx.nonce,
                    tx.gas_price
                );
                return Err(PoolError::UnderpricedReplacement {
                    old: old.gas_price,
                    new: tx.gas_price,
                });
            }
        }

        if !replaced && account_txs_size >= self.account_txs_limit {
            debug!(
                target: "pool",
                "per-account cap reached, source({}) nonce({})",
                tx.source,
                tx.nonce
            );
            return Err(PoolError::PerAccountCap(self.account_txs_limit));
        }

        let inserted_hash = tx.content_hash;
        inner.insert(tx);

        // Over capacity: shed from the tail of the priority order.
        while inner.len() > self.queue_limit {
            let victim = inner
                .priority
                .iter()
                .next_back()
                .map(|(_, _, hash)| *hash);
            let victim_hash = match victim {
                Some(hash) => hash,
                None => break,
            };
            let victim_tx = inner.by_hash.get(&victim_hash).cloned();
            if let Some(victim_tx) = victim_tx {
                debug!(
                    target: "pool",
                    "queue full, dropping tail tx hash({}) source({}) nonce({})",
                    short_hex(&victim_tx.content_hash),
                    victim_tx.source,
                    victim_tx.nonce
                );
                inner.remove(&victim_tx.source.clone(), victim_tx.nonce);
                if victim_hash == inserted_hash {
                    return Err(PoolError::PoolFull);
                }
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Up to `limit` admissible transactions in priority order, nonces
    /// contiguous per source, within the proposal byte budget.
    pub fn top(&self, limit: usize) -> Vec<TransactionEnv> {
        let inner = self.inner.read();
        let mut selected = Vec::new();
        let mut picked_nonce: HashMap<Address, u64> = HashMap::new();
        let mut broken: HashMap<Address, u64> = HashMap::new();
        let mut set_size = 0usize;

        for (_, _, hash) in &inner.priority {
            if selected.len() >= limit {
                break;
            }
            let tx = match inner.by_hash.get(hash) {
                Some(tx) => tx,
                None => continue,
            };
            if broken.contains_key(&tx.source) {
                continue;
            }

            if set_size + tx.byte_size >= TXSET_LIMIT_SIZE {
                break;
            }

            let last_seq = picked_nonce
                .get(&tx.source)
                .copied()
                .unwrap_or_else(|| inner.account_nonce.get(&tx.source).copied().unwrap_or(0));
            if tx.nonce > last_seq + 1 {
                // Gap: nothing further from this source is proposable.
                broken.insert(tx.source.clone(), last_seq + 1);
                continue;
            }

            picked_nonce.insert(tx.source.clone(), tx.nonce);
            set_size += tx.byte_size;
            selected.push(tx.env.clone());
        }

        trace!(
            target: "pool",
            "top selected {} tx(s), {} bytes",
            selected.len(),
            set_size
        );
        selected
    }

    /// Drop transactions that appear in `batch`. With `close_ledger` the
    /// cached source nonces advance to the included nonces.
    pub fn remove_batch<'a, I>(&self, batch: I, close_ledger: bool) -> u32
    where
        I: IntoIterator<Item = &'a TransactionEnv>,
    {
        let mut inner = self.inner.write();
        let mut removed = 0u32;
        for env in batch {
            let source = env.transaction.source.clone();
            let nonce = env.transaction.nonce;
            if inner.remove(&source, nonce).is_some() {
                removed += 1;
            }
            if close_ledger {
                let known = inner.account_nonce.get(&source).copied();
                if let Some(known) = known {
                    if known < nonce {
                        inner.set_account_nonce(&source, nonce);
                    }
                }
            }
        }
        trace!(
            target: "pool",
            "removed {} tx(s), {} remaining",
            removed,
            inner.len()
        );
        removed
    }

    /// Remove and return every entry older than the pool timeout.
    pub fn check_timeout(&self, now: i64) -> Vec<Arc<PooledTx>> {
        let mut inner = self.inner.write();
        let mut expired = Vec::new();
        loop {
            let head = inner.time_index.iter().next().copied();
            let (enqueue_time, hash) = match head {
                Some(head) => head,
                None => break,
            };
            if now - enqueue_time <= self.tx_timeout {
                break;
            }
            let tx = match inner.by_hash.get(&hash).cloned() {
                Some(tx) => tx,
                None => break,
            };
            inner.remove(&tx.source.clone(), tx.nonce);
            expired.push(tx);
        }
        if !expired.is_empty() {
            debug!(target: "pool", "evicted {} timed-out tx(s)", expired.len());
        }
        expired
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    /// The first `n` transactions in priority order, for the query API.
    pub fn query_top(&self, n: usize) -> Vec<TransactionEnv> {
        let inner = self.inner.read();
        inner
            .priority
            .iter()
            .take(n)
            .filter_map(|(_, _, hash)| inner.by_hash.get(hash))
            .map(|tx| tx.env.clone())
            .collect()
    }

    pub fn query_by_hash(&self, hash: &Hash32) -> Option<TransactionEnv> {
        self.inner.read().by_hash.get(hash).map(|tx| tx.env.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.read().len()
    }

    pub fn module_status(&self) -> serde_json::Value {
        let inner = self.inner.read();
        serde_json::json!({
            "transaction_size": inner.len(),
            "account_size": inner.by_account.len(),
            "queue_limit": self.queue_limit,
            "account_txs_limit": self.account_txs_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::app::Transaction;
    use umbra_types::general::MICRO_UNITS_PER_SEC;

    fn tx(source: &str, nonce: u64, gas_price: i64) -> TransactionEnv {
        TransactionEnv {
            transaction: Transaction {
                source: source.into(),
                nonce,
                gas_price,
                fee_limit: 1_000_000,
                operations: vec![],
                metadata: vec![],
            },
            signatures: vec![],
        }
    }

    fn pool() -> TxPool {
        TxPool::new(10_240, 64, 600 * MICRO_UNITS_PER_SEC, HashType::Sha256)
    }

    #[test]
    fn replacement_requires_ten_percent_bump() {
        let p = pool();
        let original = tx("a", 1, 100);
        let original_hash = p.content_hash(&original);
        p.import(original, 0, 1).unwrap();

        // 9 below the bump threshold.
        let cheap = tx("a", 1, 109);
        assert!(matches!(
            p.import(cheap, 0, 2),
            Err(PoolError::UnderpricedReplacement { old: 100, new: 109 })
        ));
        assert!(p.contains(&original_hash));

        // Exactly 10% replaces.
        let better = tx("a", 1, 110);
        let better_hash = p.content_hash(&better);
        p.import(better, 0, 3).unwrap();
        assert!(!p.contains(&original_hash));
        assert!(p.contains(&better_hash));
        assert_eq!(p.size(), 1);
    }

    #[test]
    fn import_is_idempotent() {
        let p = pool();
        let env = tx("a", 1, 100);
        p.import(env.clone(), 0, 1).unwrap();
        p.import(env.clone(), 0, 2).unwrap();
        assert_eq!(p.size(), 1);
    }

    #[test]
    fn nonce_at_or_below_applied_is_rejected() {
        let p = pool();
        assert!(matches!(
            p.import(tx("a", 3, 100), 3, 1),
            Err(PoolError::NonceTooLow { last_applied: 3, got: 3 })
        ));
        assert!(matches!(
            p.import(tx("a", 2, 100), 3, 1),
            Err(PoolError::NonceTooLow { .. })
        ));
    }

    #[test]
    fn per_account_cap_enforced() {
        let p = TxPool::new(10_240, 2, 600 * MICRO_UNITS_PER_SEC, HashType::Sha256);
        p.import(tx("a", 1, 100), 0, 1).unwrap();
        p.import(tx("a", 2, 100), 0, 2).unwrap();
        assert!(matches!(
            p.import(tx("a", 3, 100), 0, 3),
            Err(PoolError::PerAccountCap(2))
        ));
        // Replacement still allowed at the cap.
        p.import(tx("a", 2, 200), 0, 4).unwrap();
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn queue_limit_sheds_lowest_priority() {
        let p = TxPool::new(2, 64, 600 * MICRO_UNITS_PER_SEC, HashType::Sha256);
        p.import(tx("a", 1, 300), 0, 1).unwrap();
        p.import(tx("b", 1, 200), 0, 2).unwrap();
        // Same distance, lowest gas price in the pool: evicted on overflow.
        p.import(tx("c", 1, 400), 0, 3).unwrap();
        assert_eq!(p.size(), 2);
        assert!(p.query_by_hash(&p.content_hash(&tx("b", 1, 200))).is_none());

        // A newcomer that would itself rank last is refused.
        assert!(matches!(
            p.import(tx("d", 1, 100), 0, 4),
            Err(PoolError::PoolFull)
        ));
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn top_orders_by_nonce_distance_then_gas_price() {
        let p = pool();
        p.import(tx("a", 2, 100), 0, 1).unwrap();
        p.import(tx("a", 1, 100), 0, 2).unwrap();
        p.import(tx("b", 1, 50), 0, 3).unwrap();

        let batch = p.top(10);
        assert_eq!(batch.len(), 3);
        // Distance-1 entries first, higher gas price first among them.
        assert_eq!(batch[0].transaction.source, "a".into());
        assert_eq!(batch[0].transaction.nonce, 1);
        assert_eq!(batch[1].transaction.source, "b".into());
        assert_eq!(batch[2].transaction.nonce, 2);
    }

    #[test]
    fn top_skips_sources_with_nonce_gaps() {
        let p = pool();
        p.import(tx("a", 1, 100), 0, 1).unwrap();
        p.import(tx("a", 3, 500), 0, 2).unwrap();
        p.import(tx("b", 1, 10), 0, 3).unwrap();

        let batch = p.top(10);
        // a:3 is unproposable until a:2 shows up.
        assert_eq!(batch.len(), 2);
        assert!(batch
            .iter()
            .all(|env| !(env.transaction.source == "a".into() && env.transaction.nonce == 3)));

        // Contiguity per source, starting right above the applied nonce.
        let a_nonces: Vec<u64> = batch
            .iter()
            .filter(|env| env.transaction.source == "a".into())
            .map(|env| env.transaction.nonce)
            .collect();
        assert_eq!(a_nonces, vec![1]);
    }

    #[test]
    fn remove_batch_is_idempotent_and_bumps_nonces() {
        let p = pool();
        p.import(tx("a", 1, 100), 0, 1).unwrap();
        p.import(tx("a", 2, 100), 0, 2).unwrap();
        p.import(tx("b", 1, 100), 0, 3).unwrap();

        let closed = vec![tx("a", 1, 100), tx("a", 2, 100)];
        assert_eq!(p.remove_batch(closed.iter(), true), 2);
        assert_eq!(p.size(), 1);
        assert_eq!(p.remove_batch(closed.iter(), true), 0);
        assert_eq!(p.size(), 1);

        // After the bump, a:3 is immediately proposable.
        p.import(tx("a", 3, 100), 2, 4).unwrap();
        let batch = p.top(10);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn timeout_eviction_returns_expired_entries() {
        let timeout = 600 * MICRO_UNITS_PER_SEC;
        let p = TxPool::new(10_240, 64, timeout, HashType::Sha256);
        p.import(tx("a", 1, 100), 0, 1_000).unwrap();
        p.import(tx("b", 1, 100), 0, timeout / 2).unwrap();

        assert!(p.check_timeout(timeout).is_empty());

        let expired = p.check_timeout(timeout + 2_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].source, "a".into());
        assert_eq!(p.size(), 1);

        let expired = p.check_timeout(2 * timeout);
        assert_eq!(expired.len(), 1);
        assert_eq!(p.size(), 0);
    }

    #[test]
    fn byte_budget_bounds_the_batch() {
        let p = pool();
        for i in 0..3u64 {
            let mut env = tx("a", i + 1, 100);
            env.transaction.metadata = vec![0u8; 7 * 1024 * 1024];
            p.import(env, 0, i as i64).unwrap();
        }
        let batch = p.top(10);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn queries_reflect_pool_state() {
        let p = pool();
        let env = tx("a", 1, 100);
        let hash = p.content_hash(&env);
        p.import(env.clone(), 0, 1).unwrap();
        assert!(p.contains(&hash));
        assert_eq!(p.query_by_hash(&hash).map(|e| e.transaction.nonce), Some(1));
        assert_eq!(p.query_top(5).len(), 1);
        assert!(!p.contains(&[0u8; 32]));
    }
}
