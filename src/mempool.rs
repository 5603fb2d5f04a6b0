//! Bounded pool of semantically valid, non-conflicting unconfirmed
//! transactions, ordered by fee.
//!
//! Two transactions never share an input box. At capacity the lowest-fee
//! entry is evicted, and a newcomer paying no more than the current minimum
//! is rejected outright.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::types::{BoxId, ModifierId, Transaction};

pub const DEFAULT_MEMPOOL_CAPACITY: usize = 8_192;

/// Ordering key: fee descending, then timestamp ascending, id as the final
/// tiebreak for a total order.
#[derive(Clone, PartialEq, Eq, Debug)]
struct TxPriority {
    fee: u64,
    timestamp: u64,
    id: ModifierId,
}

impl Ord for TxPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .fee
            .cmp(&self.fee)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for TxPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolEntry {
    tx: Arc<Transaction>,
    priority: TxPriority,
}

pub struct Mempool {
    by_id: HashMap<ModifierId, PoolEntry>,
    by_priority: BTreeSet<TxPriority>,
    /// Input box -> transaction claiming it; enforces the no-conflict rule.
    by_input: HashMap<BoxId, ModifierId>,
    capacity: usize,
    min_fee: u64,
}

impl Mempool {
    pub fn new(capacity: usize, min_fee: u64) -> Self {
        Mempool {
            by_id: HashMap::new(),
            by_priority: BTreeSet::new(),
            by_input: HashMap::new(),
            capacity: capacity.max(1),
            min_fee,
        }
    }

    pub fn size(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &ModifierId) -> bool {
        self.by_id.contains_key(id)
    }

    fn lowest_priority(&self) -> Option<&TxPriority> {
        self.by_priority.iter().next_back()
    }

    /// Admits a transaction. Rejection reasons: duplicate id, semantic
    /// invalidity, an input already claimed by a pooled transaction, or a
    /// full pool with no entry worth evicting.
    pub fn put(&mut self, tx: Transaction) -> ChainResult<()> {
        let id = tx.id();
        if self.by_id.contains_key(&id) {
            return Err(ChainError::SemanticInvalid(
                "transaction already pooled".into(),
            ));
        }
        tx.semantic_validity(self.min_fee)?;
        for input in tx.input_ids() {
            if let Some(holder) = self.by_input.get(input) {
                return Err(ChainError::SemanticInvalid(format!(
                    "input already claimed by pooled transaction {holder}"
                )));
            }
        }
        if self.by_id.len() >= self.capacity {
            let evict = match self.lowest_priority() {
                Some(lowest) if tx.fee > lowest.fee => lowest.id,
                _ => {
                    return Err(ChainError::SemanticInvalid(
                        "pool full and fee not above current minimum".into(),
                    ))
                }
            };
            debug!(%evict, "evicting lowest-fee transaction");
            self.remove_one(&evict);
        }

        let priority = TxPriority {
            fee: tx.fee,
            timestamp: tx.timestamp,
            id,
        };
        for input in tx.input_ids() {
            self.by_input.insert(*input, id);
        }
        self.by_priority.insert(priority.clone());
        self.by_id.insert(
            id,
            PoolEntry {
                tx: Arc::new(tx),
                priority,
            },
        );
        Ok(())
    }

    /// Up to `limit` transactions, fee descending, timestamp ascending on
    /// ties.
    pub fn take(&self, limit: usize) -> Vec<Arc<Transaction>> {
        self.by_priority
            .iter()
            .take(limit)
            .filter_map(|priority| self.by_id.get(&priority.id).map(|e| e.tx.clone()))
            .collect()
    }

    /// All pooled transactions in priority order.
    pub fn ordered(&self) -> Vec<Arc<Transaction>> {
        self.take(self.by_id.len())
    }

    fn remove_one(&mut self, id: &ModifierId) -> Option<Arc<Transaction>> {
        let entry = self.by_id.remove(id)?;
        self.by_priority.remove(&entry.priority);
        for input in entry.tx.input_ids() {
            if self.by_input.get(input) == Some(id) {
                self.by_input.remove(input);
            }
        }
        Some(entry.tx)
    }

    /// Idempotent bulk removal, used on confirmation and on stateful
    /// invalidation during candidate assembly.
    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a ModifierId>) {
        for id in ids {
            self.remove_one(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::deterministic_keypair;
    use crate::types::transaction::{Directive, Unlocker};
    use crate::types::Proposition;

    fn tx_spending(seed: u8, input: u8, fee: u64, timestamp: u64) -> Transaction {
        let keypair = deterministic_keypair(seed);
        Transaction::new_signed(
            &keypair,
            fee,
            timestamp,
            vec![Unlocker {
                box_id: BoxId {
                    tag: 1,
                    hash: [input; 32],
                },
                proof: None,
            }],
            vec![Directive::Transfer {
                proposition: Proposition::PublicKey([seed; 32]),
                amount: 1,
                token_id: None,
            }],
        )
    }

    #[test]
    fn orders_by_fee_then_timestamp() {
        let mut pool = Mempool::new(16, 1);
        pool.put(tx_spending(1, 1, 5, 200)).unwrap();
        pool.put(tx_spending(2, 2, 9, 100)).unwrap();
        pool.put(tx_spending(3, 3, 5, 100)).unwrap();

        let ordered = pool.take(3);
        assert_eq!(ordered[0].fee, 9);
        assert_eq!(ordered[1].fee, 5);
        assert_eq!(ordered[1].timestamp, 100);
        assert_eq!(ordered[2].timestamp, 200);
    }

    #[test]
    fn rejects_duplicate_id() {
        let mut pool = Mempool::new(16, 1);
        let tx = tx_spending(1, 1, 5, 100);
        pool.put(tx.clone()).unwrap();
        assert!(pool.put(tx).is_err());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn rejects_conflicting_input() {
        let mut pool = Mempool::new(16, 1);
        pool.put(tx_spending(1, 7, 5, 100)).unwrap();
        // Different author, same input box.
        let err = pool.put(tx_spending(2, 7, 9, 100)).unwrap_err();
        assert!(matches!(err, ChainError::SemanticInvalid(_)));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn capacity_evicts_lowest_fee() {
        let mut pool = Mempool::new(2, 1);
        pool.put(tx_spending(1, 1, 5, 100)).unwrap();
        pool.put(tx_spending(2, 2, 9, 100)).unwrap();

        // Fee below the current minimum is rejected.
        assert!(pool.put(tx_spending(3, 3, 5, 100)).is_err());
        assert_eq!(pool.size(), 2);

        // A better fee evicts the lowest.
        pool.put(tx_spending(4, 4, 7, 100)).unwrap();
        assert_eq!(pool.size(), 2);
        let fees: Vec<u64> = pool.take(2).iter().map(|tx| tx.fee).collect();
        assert_eq!(fees, vec![9, 7]);
    }

    #[test]
    fn removal_is_idempotent_and_frees_inputs() {
        let mut pool = Mempool::new(16, 1);
        let tx = tx_spending(1, 7, 5, 100);
        let id = tx.id();
        pool.put(tx).unwrap();

        pool.remove_all([&id]);
        pool.remove_all([&id]);
        assert_eq!(pool.size(), 0);

        // The input is free again.
        pool.put(tx_spending(2, 7, 9, 100)).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn rejects_semantically_invalid() {
        let mut pool = Mempool::new(16, 10);
        // Fee below the pool's minimum fee rule.
        let err = pool.put(tx_spending(1, 1, 5, 100)).unwrap_err();
        assert!(matches!(err, ChainError::SemanticInvalid(_)));
    }
}
