//! Executor adapter.
//!
//! The block former hands the transactions of a block together with a
//! [`BlockContext`] to an [`Executor`] and commits whatever it reports back.
//! Failing transactions turn into receipts with `status = 0`; transactions that
//! cannot be executed at all (bad nonce, unpayable, over the block gas limit)
//! are reported as [`SkippedTx`] and left out of the block. Only a mismatch
//! between the parent block and the state database fails the whole call.
//!
//! [`TransferExecutor`] is the built-in executor: value transfers, driver
//! governance calls and precompile pricing over a [`StateDb`]. Contract code
//! is not interpreted.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::sync::Arc;

use alloy_consensus::TxEnvelope;
use alloy_primitives::{Address, B256, Bloom, Log};
use sonic_chainspec::{Rules, Upgrades};
use sonic_kvdb::StoreError;
use sonic_primitives::{BlockNumber, Receipt, Timestamp};

pub mod driver;
pub use driver::GovernanceAction;

pub mod gas;

mod state;
pub use state::{Account, StateDb, StateDiff};

mod transfer;
pub use transfer::TransferExecutor;

/// Environment a block executes in.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub number: BlockNumber,
    pub timestamp: Timestamp,
    /// Receiver of priority fees; fees sent to the zero address are burnt.
    pub coinbase: Address,
    pub prev_randao: B256,
    pub base_fee: u64,
    pub blob_base_fee: u128,
    pub chain_id: u64,
    pub gas_limit: u64,
    pub upgrades: Upgrades,
    /// Rules of the block's epoch; driver calls are validated against them.
    pub rules: Arc<Rules>,
}

impl BlockContext {
    /// Context for block `number` under `rules`, with the minimum base fee.
    pub fn new(number: BlockNumber, timestamp: Timestamp, prev_randao: B256, rules: Arc<Rules>) -> Self {
        Self {
            number,
            timestamp,
            coinbase: Address::ZERO,
            prev_randao,
            base_fee: rules.economy.min_base_fee,
            blob_base_fee: 1,
            chain_id: rules.network_id,
            gas_limit: rules.blocks.max_block_gas,
            upgrades: rules.upgrades,
            rules,
        }
    }
}

/// Why a transaction was left out of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("signature does not recover")]
    BadSignature,
    #[error("wrong chain id")]
    WrongChainId,
    #[error("nonce already used")]
    NonceTooLow,
    #[error("nonce ahead of the sender's account")]
    NonceTooHigh,
    #[error("gas limit below the intrinsic cost")]
    IntrinsicGasTooLow,
    #[error("max fee below the base fee")]
    FeeTooLow,
    #[error("sender cannot pay for gas and value")]
    InsufficientFunds,
    #[error("does not fit into the block gas limit")]
    BlockGasLimit,
    #[error("transaction type not supported")]
    Unsupported,
}

impl SkipReason {
    /// Whether the transaction can never become executable.
    pub const fn is_permanent(&self) -> bool {
        !matches!(
            self,
            Self::NonceTooHigh | Self::InsufficientFunds | Self::BlockGasLimit | Self::FeeTooLow
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedTx {
    pub hash: B256,
    pub reason: SkipReason,
}

/// What an executor reports for a block.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    /// Executed transactions, in input order; `receipts[i]` belongs to `transactions[i]`.
    pub transactions: Vec<TxEnvelope>,
    pub receipts: Vec<Receipt>,
    pub skipped: Vec<SkippedTx>,
    pub gas_used: u64,
    pub state_root: B256,
    pub logs_bloom: Bloom,
    /// Successful driver calls, in execution order.
    pub governance: Vec<GovernanceAction>,
}

impl ExecutionOutcome {
    pub fn logs(&self) -> impl Iterator<Item = &Log> {
        self.receipts.iter().flat_map(|receipt| receipt.logs.iter())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("parent state root `{expected}` does not match the state database root `{actual}`")]
    StateRootMismatch { expected: B256, actual: B256 },
    #[error("block `{number}` does not follow the state database head `{head:?}`")]
    NonContiguous {
        number: BlockNumber,
        head: Option<BlockNumber>,
    },
    #[error("state storage failed")]
    Storage(#[from] StoreError),
}

/// Executes the transactions of a block on top of the parent state.
pub trait Executor: Send + Sync {
    /// Executes `transactions` in order and commits the resulting state as
    /// block `ctx.number`.
    fn execute(
        &self,
        parent_state_root: B256,
        ctx: &BlockContext,
        transactions: Vec<TxEnvelope>,
    ) -> Result<ExecutionOutcome, ExecutionError>;

    /// Root of the state after the last executed block.
    fn state_root(&self) -> B256;

    /// Last executed block; `None` before genesis.
    fn head(&self) -> Option<BlockNumber>;

    /// Discards every executed block after `number` and returns the state
    /// root of `number`.
    fn revert_to(&self, number: BlockNumber) -> Result<B256, ExecutionError>;
}
