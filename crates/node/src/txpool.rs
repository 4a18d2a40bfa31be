//! Pending transactions keyed by `(sender, nonce)`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use alloy_primitives::{Address, B256};
use sonic_primitives::RecoveredTx;
use tracing::debug;

/// Transactions kept before new ones are refused.
pub const DEFAULT_POOL_CAPACITY: usize = 16_384;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction `{0}` is already known")]
    AlreadyKnown(B256),
    #[error("nonce `{nonce}` is below the sender's account nonce `{account}`")]
    NonceTooLow { nonce: u64, account: u64 },
    #[error("replacement for nonce `{0}` does not pay a higher tip")]
    ReplacementUnderpriced(u64),
    #[error("pool is full")]
    Full,
}

#[derive(Debug)]
pub struct TxPool {
    by_sender: BTreeMap<Address, BTreeMap<u64, Arc<RecoveredTx>>>,
    by_hash: HashMap<B256, (Address, u64)>,
    capacity: usize,
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_sender: BTreeMap::new(),
            by_hash: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &B256) -> Option<Arc<RecoveredTx>> {
        let (sender, nonce) = self.by_hash.get(hash)?;
        self.by_sender.get(sender)?.get(nonce).cloned()
    }

    /// Adds `tx`, replacing a pooled transaction with the same sender and
    /// nonce only if the new one pays a higher tip at `base_fee`.
    pub fn insert(&mut self, tx: RecoveredTx, account_nonce: u64, base_fee: u64) -> Result<(), PoolError> {
        let hash = tx.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(PoolError::AlreadyKnown(hash));
        }
        let (sender, nonce) = (tx.sender(), tx.nonce());
        if nonce < account_nonce {
            return Err(PoolError::NonceTooLow {
                nonce,
                account: account_nonce,
            });
        }

        let replaced = match self.by_sender.get(&sender).and_then(|txs| txs.get(&nonce)) {
            Some(existing) if existing.effective_tip(base_fee) >= tx.effective_tip(base_fee) => {
                return Err(PoolError::ReplacementUnderpriced(nonce));
            }
            Some(existing) => Some(existing.hash()),
            None if self.by_hash.len() >= self.capacity => return Err(PoolError::Full),
            None => None,
        };
        if let Some(replaced) = replaced {
            debug!(%replaced, by = %hash, "replaced pooled transaction");
            self.by_hash.remove(&replaced);
        }
        self.by_hash.insert(hash, (sender, nonce));
        self.by_sender
            .entry(sender)
            .or_default()
            .insert(nonce, Arc::new(tx));
        Ok(())
    }

    /// Every pooled transaction, by sender and then nonce.
    pub fn pending(&self) -> impl Iterator<Item = &Arc<RecoveredTx>> + '_ {
        self.by_sender.values().flat_map(|txs| txs.values())
    }

    /// Drops transactions made obsolete by a block: for every included
    /// `(sender, nonce)` all pooled transactions of that sender up to the nonce,
    /// and every transaction in `dropped`.
    pub fn evict<'a>(
        &mut self,
        included: impl IntoIterator<Item = (Address, u64)>,
        dropped: impl IntoIterator<Item = &'a B256>,
    ) -> usize {
        let before = self.by_hash.len();
        for (sender, nonce) in included {
            let Some(txs) = self.by_sender.get_mut(&sender) else {
                continue;
            };
            let keep = txs.split_off(&(nonce + 1));
            for tx in std::mem::replace(txs, keep).into_values() {
                self.by_hash.remove(&tx.hash());
            }
            if txs.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        for hash in dropped {
            if let Some((sender, nonce)) = self.by_hash.remove(hash)
                && let Some(txs) = self.by_sender.get_mut(&sender)
            {
                txs.remove(&nonce);
                if txs.is_empty() {
                    self.by_sender.remove(&sender);
                }
            }
        }
        before - self.by_hash.len()
    }
}
