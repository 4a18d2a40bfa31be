//! Epochs and governance.
//!
//! The active [`EpochState`] never changes. Governance actions reported by the
//! executor accumulate in [`PendingChanges`], which are persisted with every
//! block and folded into the next epoch when the current one seals.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use sonic_chainspec::{Genesis, Rules};
use sonic_dag::EpochContext;
use sonic_evm::GovernanceAction;
use sonic_primitives::{
    Block, BlockNumber, Epoch, Stake, Timestamp, ValidatorId, ValidatorProfile, Validators,
};
use sonic_scc::{BlsError, Committee};
use tracing::{info, warn};

/// Configuration of one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochState {
    pub epoch: Epoch,
    /// Validators with non-zero weight, sorted by id.
    pub validators: Vec<ValidatorProfile>,
    pub rules: Rules,
    /// First block of the epoch.
    pub start_block: BlockNumber,
    /// Timestamp of the last block of the previous epoch.
    pub start_time: Timestamp,
}

impl EpochState {
    /// Epoch 1, which also holds the genesis block.
    pub fn genesis(genesis: &Genesis) -> Self {
        let mut validators = genesis.validators.clone();
        validators.sort_by_key(|validator| validator.id);
        Self {
            epoch: 1,
            validators,
            rules: genesis.rules.clone(),
            start_block: 0,
            start_time: genesis.time,
        }
    }

    pub fn context(&self) -> EpochContext {
        EpochContext::new(
            self.epoch,
            &self.validators,
            self.rules.clone(),
            self.start_time,
        )
    }

    pub fn validator_set(&self) -> Validators {
        Validators::new(self.validators.iter().map(|v| (v.id, v.weight)))
    }

    pub fn committee(&self) -> Result<Committee, BlsError> {
        Committee::from_profiles(&self.validators)
    }

    pub fn validator(&self, id: ValidatorId) -> Option<&ValidatorProfile> {
        self.validators.iter().find(|validator| validator.id == id)
    }
}

/// Governance decisions waiting for the next epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChanges {
    /// Rules of the next epoch, with every diff posted so far merged in.
    pub rules: Option<Rules>,
    pub weights: BTreeMap<ValidatorId, Stake>,
    /// Epoch seals requested by governance and not performed yet.
    pub seals: u64,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.rules.is_none() && self.weights.is_empty() && self.seals == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealReason {
    /// Consensus reached the frame cap of the epoch.
    FrameCap,
    /// The driver contract asked for an epoch advance.
    Governance,
    MaxEpochGas,
    MaxEpochDuration,
}

impl fmt::Display for SealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FrameCap => "frame_cap",
            Self::Governance => "governance",
            Self::MaxEpochGas => "max_epoch_gas",
            Self::MaxEpochDuration => "max_epoch_duration",
        })
    }
}

/// Owns the active epoch and the pending governance changes.
#[derive(Debug)]
pub struct EpochManager {
    current: Arc<EpochState>,
    pending: PendingChanges,
}

impl EpochManager {
    pub fn new(current: Arc<EpochState>, pending: PendingChanges) -> Self {
        Self { current, pending }
    }

    pub fn current(&self) -> &Arc<EpochState> {
        &self.current
    }

    pub fn rules(&self) -> &Rules {
        &self.current.rules
    }

    pub const fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    /// Whether governance asked to seal the epoch with the next block.
    pub const fn seal_requested(&self) -> bool {
        self.pending.seals > 0
    }

    /// Records a governance action of a committed block.
    pub fn apply(&mut self, action: &GovernanceAction) {
        match action {
            GovernanceAction::UpdateRules(diff) => {
                let base = self.pending.rules.as_ref().unwrap_or(&self.current.rules);
                match base.merge(diff) {
                    Ok(rules) => {
                        info!(epoch = self.current.epoch + 1, "rules update scheduled");
                        self.pending.rules = Some(rules);
                    }
                    Err(error) => warn!(
                        %error,
                        "rules update does not apply on top of earlier pending updates, ignored"
                    ),
                }
            }
            GovernanceAction::AdvanceEpochs(seals) => {
                self.pending.seals = self.pending.seals.saturating_add(*seals);
            }
            GovernanceAction::UpdateValidatorWeight { validator, weight } => {
                self.pending.weights.insert(*validator, *weight);
            }
        }
    }

    /// Why the epoch must seal after a block with `timestamp` that brought the
    /// gas of the epoch to `epoch_gas`.
    pub fn seal_reason(&self, timestamp: Timestamp, epoch_gas: u64, frame_cap: bool) -> Option<SealReason> {
        let epochs = &self.current.rules.epochs;
        if frame_cap {
            Some(SealReason::FrameCap)
        } else if self.pending.seals > 0 {
            Some(SealReason::Governance)
        } else if epoch_gas >= epochs.max_epoch_gas {
            Some(SealReason::MaxEpochGas)
        } else if timestamp.saturating_sub(self.current.start_time) >= epochs.max_epoch_duration {
            Some(SealReason::MaxEpochDuration)
        } else {
            None
        }
    }

    /// Seals the current epoch after `last` and opens the next one with the
    /// pending rules and weights.
    pub fn seal(&mut self, last: &Block) -> Arc<EpochState> {
        let mut validators: BTreeMap<ValidatorId, ValidatorProfile> = self
            .current
            .validators
            .iter()
            .map(|validator| (validator.id, validator.clone()))
            .collect();
        for (id, weight) in std::mem::take(&mut self.pending.weights) {
            match validators.get_mut(&id) {
                Some(validator) => validator.weight = weight,
                None => warn!(validator = id, "weight update for an unknown validator, ignored"),
            }
        }
        let mut validators: Vec<_> = validators
            .into_values()
            .filter(|validator| validator.weight > 0)
            .collect();
        if validators.is_empty() {
            warn!("weight updates would remove every validator, keeping the current set");
            validators = self.current.validators.clone();
        }

        let next = Arc::new(EpochState {
            epoch: self.current.epoch + 1,
            validators,
            rules: self
                .pending
                .rules
                .take()
                .unwrap_or_else(|| self.current.rules.clone()),
            start_block: last.number() + 1,
            start_time: last.timestamp(),
        });
        self.pending.seals = self.pending.seals.saturating_sub(1);
        self.current = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::B256;
    use serde_json::json;
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
    use sonic_primitives::BlockFields;

    use super::*;

    fn manager() -> EpochManager {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        EpochManager::new(Arc::new(EpochState::genesis(&genesis)), PendingChanges::default())
    }

    fn block(number: BlockNumber, timestamp: Timestamp) -> Block {
        Block::assemble(
            BlockFields {
                number,
                parent_hash: B256::ZERO,
                timestamp,
                prev_randao: B256::ZERO,
                gas_limit: 1,
                gas_used: 0,
                base_fee: 0,
                state_root: B256::ZERO,
                receipts_root: B256::ZERO,
                logs_bloom: Default::default(),
                proposer: 0,
                epoch: 1,
            },
            Vec::new(),
        )
    }

    #[test]
    fn rule_updates_wait_for_the_next_epoch() {
        let mut manager = manager();
        manager.apply(&GovernanceAction::UpdateRules(
            json!({"Blocks": {"MaxEmptyBlockSkipPeriod": 4_000_000_000u64}}),
        ));
        manager.apply(&GovernanceAction::UpdateRules(
            json!({"Emitter": {"Interval": 250_000_000u64}}),
        ));
        assert_eq!(
            manager.rules().blocks.max_empty_block_skip_period,
            Duration::from_secs(1)
        );

        let start = manager.current().start_time;
        let next = manager.seal(&block(9, start.saturating_add(Duration::from_secs(3))));
        assert_eq!(next.epoch, 2);
        assert_eq!(next.start_block, 10);
        assert_eq!(next.rules.blocks.max_empty_block_skip_period, Duration::from_secs(4));
        assert_eq!(next.rules.emitter.interval, Duration::from_millis(250));
        assert!(manager.pending().is_empty());
    }

    #[test]
    fn weights_apply_at_seal() {
        let mut manager = manager();
        manager.apply(&GovernanceAction::UpdateValidatorWeight {
            validator: 3,
            weight: 0,
        });
        manager.apply(&GovernanceAction::UpdateValidatorWeight {
            validator: 1,
            weight: 5,
        });
        assert_eq!(manager.current().validators.len(), 3);

        let next = manager.seal(&block(1, Timestamp::from_secs(1_700_000_001)));
        let ids: Vec<_> = next.validators.iter().map(|v| (v.id, v.weight)).collect();
        assert_eq!(ids, vec![(1, 5), (2, 1_000_000)]);
    }

    #[test]
    fn seal_reasons() {
        let mut manager = manager();
        let start = manager.current().start_time;
        let rules = manager.rules().clone();

        assert_eq!(manager.seal_reason(start, 0, false), None);
        assert_eq!(manager.seal_reason(start, 0, true), Some(SealReason::FrameCap));
        assert_eq!(
            manager.seal_reason(start, rules.epochs.max_epoch_gas, false),
            Some(SealReason::MaxEpochGas)
        );
        let late = start.saturating_add(rules.epochs.max_epoch_duration);
        assert_eq!(
            manager.seal_reason(late, 0, false),
            Some(SealReason::MaxEpochDuration)
        );

        manager.apply(&GovernanceAction::AdvanceEpochs(2));
        assert_eq!(manager.seal_reason(start, 0, false), Some(SealReason::Governance));
        manager.seal(&block(1, start));
        assert!(manager.seal_requested());
        manager.seal(&block(2, start));
        assert!(!manager.seal_requested());
    }
}
