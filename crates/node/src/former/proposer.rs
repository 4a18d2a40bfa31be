//! Single-proposer block formation: election, turns and proposal checks.

use alloy_primitives::{B256, U256, keccak256};
use sonic_chainspec::Rules;
use sonic_evm::gas;
use sonic_primitives::{
    BlockNumber, Frame, Proposal, RecoveredTx, ValidatorId, Validators, check_chain_id,
};

use crate::store::ChainHead;

/// Frames without a block after which the next proposer is elected.
pub const TURN_TIMEOUT_FRAMES: Frame = 6;

/// Turn reached at `frame` when the head block was formed at `block_frame`.
pub const fn reached_turn(frame: Frame, block_frame: Frame) -> u32 {
    frame.saturating_sub(block_frame) / TURN_TIMEOUT_FRAMES
}

/// Randomness a proposal on top of `head` must carry.
pub fn next_randao(head: &ChainHead) -> B256 {
    keccak256([head.prev_randao.as_slice(), head.hash.as_slice()].concat())
}

pub fn election_seed(parent_hash: B256, number: BlockNumber, prev_randao: B256, turn: u32) -> B256 {
    let mut buf = Vec::with_capacity(32 + 8 + 32 + 4);
    buf.extend_from_slice(parent_hash.as_slice());
    buf.extend_from_slice(&number.to_be_bytes());
    buf.extend_from_slice(prev_randao.as_slice());
    buf.extend_from_slice(&turn.to_be_bytes());
    keccak256(buf)
}

/// Picks a validator with probability proportional to its stake.
pub fn elect(validators: &Validators, seed: B256) -> Option<ValidatorId> {
    let total = validators.total_stake();
    if total == 0 {
        return None;
    }
    let point = U256::from_be_bytes(seed.0) % U256::from(total);
    let mut acc = U256::ZERO;
    validators.iter().find_map(|(id, stake)| {
        acc += U256::from(stake);
        (point < acc).then_some(id)
    })
}

/// Proposer of block `head.number + 1` in `turn`.
pub fn proposer_of(validators: &Validators, head: &ChainHead, turn: u32) -> Option<ValidatorId> {
    elect(
        validators,
        election_seed(head.hash, head.number + 1, head.prev_randao, turn),
    )
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("proposal for block `{got}`, expected `{expected}`")]
    WrongNumber { got: BlockNumber, expected: BlockNumber },
    #[error("proposal does not build on the head block")]
    WrongParent,
    #[error("proposal timestamp is not after the head block")]
    TimestampNotAfterParent,
    #[error("proposal carries the wrong randomness")]
    WrongRandao,
    #[error("proposal is for turn `{turn}`, only turn `{reached}` is reached")]
    TurnNotReached { turn: u32, reached: u32 },
    #[error("validator `{creator}` is not the proposer of turn `{turn}`")]
    NotElected { creator: ValidatorId, turn: u32 },
    #[error("empty proposal before the empty-block period elapsed")]
    EmptyTooEarly,
    #[error("transaction `{index}` is invalid: {reason}")]
    InvalidTransaction { index: usize, reason: String },
    #[error("proposal gas `{total}` exceeds the block limit `{limit}`")]
    GasLimitExceeded { total: u64, limit: u64 },
}

/// Checks a proposal created by `creator` and decided at `frame` against the
/// chain head.
pub fn validate(
    proposal: &Proposal,
    creator: ValidatorId,
    frame: Frame,
    head: &ChainHead,
    validators: &Validators,
    rules: &Rules,
) -> Result<(), ProposalError> {
    let expected = head.number + 1;
    if proposal.number != expected {
        return Err(ProposalError::WrongNumber {
            got: proposal.number,
            expected,
        });
    }
    if proposal.parent_hash != head.hash {
        return Err(ProposalError::WrongParent);
    }
    if proposal.timestamp <= head.timestamp {
        return Err(ProposalError::TimestampNotAfterParent);
    }
    if proposal.prev_randao != next_randao(head) {
        return Err(ProposalError::WrongRandao);
    }
    let reached = reached_turn(frame, head.block_frame);
    if proposal.turn > reached {
        return Err(ProposalError::TurnNotReached {
            turn: proposal.turn,
            reached,
        });
    }
    if proposer_of(validators, head, proposal.turn) != Some(creator) {
        return Err(ProposalError::NotElected {
            creator,
            turn: proposal.turn,
        });
    }
    if proposal.transactions.is_empty()
        && proposal.timestamp.saturating_sub(head.timestamp)
            < rules.blocks.max_empty_block_skip_period
    {
        return Err(ProposalError::EmptyTooEarly);
    }

    let mut total: u64 = 0;
    for (index, tx) in proposal.transactions.iter().enumerate() {
        let invalid = |reason: String| ProposalError::InvalidTransaction { index, reason };
        let recovered = RecoveredTx::recover(tx.clone()).map_err(|err| invalid(err.to_string()))?;
        check_chain_id(recovered.tx(), rules.network_id, true)
            .map_err(|err| invalid(err.to_string()))?;
        if recovered.gas_limit() < gas::minimum_gas(&rules.upgrades, recovered.tx()) {
            return Err(invalid("gas limit below the intrinsic cost".to_string()));
        }
        total = total.saturating_add(recovered.gas_limit());
    }
    if total > rules.blocks.max_block_gas {
        return Err(ProposalError::GasLimitExceeded {
            total,
            limit: rules.blocks.max_block_gas,
        });
    }
    Ok(())
}
