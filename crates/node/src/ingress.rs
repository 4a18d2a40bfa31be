//! Admission of transactions into the pool, from RPC and from peers.

use std::sync::Arc;

use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::{Decodable2718 as _, Eip2718Error, Encodable2718 as _};
use alloy_primitives::B256;
use bytes::Bytes;
use parking_lot::RwLock;
use sonic_evm::{StateDb, gas::minimum_gas};
use sonic_primitives::{RecoveredTx, TxError, check_chain_id};
use tracing::{debug, trace};

use crate::{
    network::{Gossip, Network},
    store::ChainStore,
    txpool::{PoolError, TxPool},
};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed decoding transaction")]
    Decode(#[from] Eip2718Error),
    #[error(transparent)]
    Invalid(#[from] TxError),
    #[error("gas limit `{limit}` is below the required minimum `{required}`")]
    IntrinsicGas { limit: u64, required: u64 },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Checks transactions against the current chain and puts them into the pool.
#[derive(Clone)]
pub struct TxIngress {
    pool: Arc<RwLock<TxPool>>,
    state: Arc<RwLock<StateDb>>,
    store: Arc<ChainStore>,
    network: Arc<dyn Network>,
    allow_unprotected: bool,
}

impl std::fmt::Debug for TxIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxIngress")
            .field("allow_unprotected", &self.allow_unprotected)
            .finish_non_exhaustive()
    }
}

impl TxIngress {
    pub fn new(
        pool: Arc<RwLock<TxPool>>,
        state: Arc<RwLock<StateDb>>,
        store: Arc<ChainStore>,
        network: Arc<dyn Network>,
        allow_unprotected: bool,
    ) -> Self {
        Self {
            pool,
            state,
            store,
            network,
            allow_unprotected,
        }
    }

    pub fn pool(&self) -> &Arc<RwLock<TxPool>> {
        &self.pool
    }

    /// Admits an EIP-2718 encoded transaction. Transactions submitted locally
    /// (`relay`) are gossiped to the peers.
    pub fn submit_raw(&self, raw: &[u8], relay: bool) -> Result<B256, SubmitError> {
        let tx = TxEnvelope::decode_2718(&mut &raw[..])?;
        self.submit(tx, relay)
    }

    pub fn submit(&self, tx: TxEnvelope, relay: bool) -> Result<B256, SubmitError> {
        let rules = self.store.epoch_state().rules.clone();
        check_chain_id(&tx, rules.network_id, self.allow_unprotected)?;
        let required = minimum_gas(&rules.upgrades, &tx);
        let limit = alloy_consensus::Transaction::gas_limit(&tx);
        if limit < required {
            return Err(SubmitError::IntrinsicGas { limit, required });
        }
        let tx = RecoveredTx::recover(tx)?;
        let hash = tx.hash();
        let raw = relay.then(|| Bytes::from(tx.tx().encoded_2718()));
        let account = self.state.read().account(&tx.sender());
        self.pool
            .write()
            .insert(tx, account.nonce, rules.economy.min_base_fee)
            .inspect_err(|error| trace!(%hash, %error, "transaction not pooled"))?;
        debug!(%hash, relay, "transaction pooled");
        if let Some(raw) = raw {
            self.network.broadcast(Gossip::Transaction(raw));
        }
        Ok(hash)
    }
}
