//! Distributed block formation: every decided batch becomes one block made
//! of the transactions of all its events.

use std::{cmp::Reverse, collections::HashSet, sync::Arc};

use alloy_primitives::{B256, keccak256};
use sonic_primitives::{Event, RecoveredTx, Timestamp, event::EventId};
use tracing::debug;

/// Transactions of `events` without duplicates, by sender, then nonce, then
/// tip descending, then position in the batch.
pub fn order_transactions(events: &[Arc<Event>], base_fee: u64) -> Vec<RecoveredTx> {
    let mut seen = HashSet::new();
    let mut txs: Vec<(usize, RecoveredTx)> = events
        .iter()
        .flat_map(|event| event.payload.transactions())
        .filter(|tx| seen.insert(*tx.tx_hash()))
        .filter_map(|tx| match RecoveredTx::recover(tx.clone()) {
            Ok(tx) => Some(tx),
            Err(error) => {
                debug!(hash = %tx.tx_hash(), %error, "dropping decided transaction");
                None
            }
        })
        .enumerate()
        .collect();
    txs.sort_by_key(|(position, tx)| {
        (
            tx.sender(),
            tx.nonce(),
            Reverse(tx.effective_tip(base_fee)),
            *position,
        )
    });
    txs.into_iter().map(|(_, tx)| tx).collect()
}

/// Randomness of the block confirmed by `atropos`.
pub fn next_randao(prev_randao: B256, atropos: &EventId) -> B256 {
    keccak256([prev_randao.as_slice(), atropos.as_slice()].concat())
}

/// Block time: the batch's median time, but strictly after the parent.
pub fn block_time(median_time: Timestamp, parent: Timestamp) -> Timestamp {
    median_time.max(Timestamp::from_nanos(parent.as_nanos() + 1))
}
