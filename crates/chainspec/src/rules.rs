//! Network rules.
//!
//! [`Rules`] is a plain value. Governance changes it by posting a JSON diff,
//! which [`Rules::merge`] applies as a recursive object merge; the result must
//! still deserialize (unknown keys are rejected) and pass [`Rules::validate`].
//! The JSON shape uses PascalCase keys and nanosecond integers for durations,
//! e.g. `{"Blocks":{"MaxEmptyBlockSkipPeriod":4000000000}}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Upgrades;

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("rules diff must be a JSON object")]
    DiffNotAnObject,
    #[error("failed (de)serializing rules")]
    Json(#[from] serde_json::Error),
    #[error("invalid rules: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Rules {
    pub name: String,
    /// Chain id of the network.
    #[serde(rename = "NetworkID")]
    pub network_id: u64,
    pub dag: DagRules,
    pub emitter: EmitterRules,
    pub epochs: EpochsRules,
    pub blocks: BlocksRules,
    pub economy: EconomyRules,
    pub upgrades: Upgrades,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DagRules {
    pub max_parents: u32,
    /// Parents beyond this count are charged `ParentGas` each.
    pub max_free_parents: u32,
    /// Largest accepted wire size of an event, in bytes.
    pub max_event_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EmitterRules {
    /// Cadence at which validators emit events.
    #[serde(with = "nanos")]
    pub interval: Duration,
    /// Emission slows down to `StalledInterval` when nothing was decided for this long.
    #[serde(with = "nanos")]
    pub stall_threshold: Duration,
    #[serde(with = "nanos")]
    pub stalled_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EpochsRules {
    pub max_epoch_gas: u64,
    #[serde(with = "nanos")]
    pub max_epoch_duration: Duration,
    /// Consensus seals the epoch once a frame this high is decided.
    pub max_epoch_frames: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BlocksRules {
    pub max_block_gas: u64,
    /// Minimum spacing of blocks without transactions.
    #[serde(with = "nanos")]
    pub max_empty_block_skip_period: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct EconomyRules {
    pub min_base_fee: u64,
    pub gas: GasRules,
    pub short_gas_power: GasPowerRules,
    pub long_gas_power: GasPowerRules,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GasRules {
    pub max_event_gas: u64,
    /// Base cost of every event.
    pub event_gas: u64,
    pub parent_gas: u64,
    /// Ceiling on the gas a single rules update may cost; must stay below
    /// `MaxEventGas` so the update always fits into one event.
    pub upper_bound_for_rule_change_gas_costs: u64,
}

/// Linear gas-power allocator of one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GasPowerRules {
    /// Network-wide refill rate, split among validators by stake.
    pub alloc_per_sec: u64,
    /// Refill stops once this much time worth of allocation is accumulated.
    #[serde(with = "nanos")]
    pub max_alloc_period: Duration,
    /// Allocation of a validator's first event in an epoch.
    #[serde(with = "nanos")]
    pub startup_alloc_period: Duration,
    pub min_startup_gas: u64,
}

impl Rules {
    /// Rules of a local test network.
    pub fn fakenet(network_id: u64, upgrades: Upgrades) -> Self {
        Self {
            name: "fake".to_string(),
            network_id,
            dag: DagRules {
                max_parents: 10,
                max_free_parents: 3,
                max_event_size: 4 * 1024 * 1024,
            },
            emitter: EmitterRules {
                interval: Duration::from_millis(500),
                stall_threshold: Duration::from_secs(30),
                stalled_interval: Duration::from_secs(60),
            },
            epochs: EpochsRules {
                max_epoch_gas: 1_500_000_000_000,
                max_epoch_duration: Duration::from_secs(4 * 60 * 60),
                max_epoch_frames: 100_000,
            },
            blocks: BlocksRules {
                max_block_gas: 1_000_000_000,
                max_empty_block_skip_period: Duration::from_secs(1),
            },
            economy: EconomyRules {
                min_base_fee: 1_000_000_000,
                gas: GasRules {
                    max_event_gas: 200_000_000,
                    event_gas: 28_000,
                    parent_gas: 2_400,
                    upper_bound_for_rule_change_gas_costs: 50_000_000,
                },
                short_gas_power: GasPowerRules {
                    alloc_per_sec: 2_000_000_000,
                    max_alloc_period: Duration::from_secs(2),
                    startup_alloc_period: Duration::from_secs(1),
                    min_startup_gas: 200_000_000,
                },
                long_gas_power: GasPowerRules {
                    alloc_per_sec: 1_000_000_000,
                    max_alloc_period: Duration::from_secs(30),
                    startup_alloc_period: Duration::from_secs(5),
                    min_startup_gas: 200_000_000,
                },
            },
            upgrades,
        }
    }

    /// Applies a JSON diff and validates the result.
    pub fn merge(&self, diff: &Value) -> Result<Self, RulesError> {
        if !diff.is_object() {
            return Err(RulesError::DiffNotAnObject);
        }
        let mut value = serde_json::to_value(self)?;
        merge_json(&mut value, diff);
        let merged: Self = serde_json::from_value(value)?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), RulesError> {
        self.upgrades.validate().map_err(RulesError::Invalid)?;
        let gas = &self.economy.gas;
        if gas.upper_bound_for_rule_change_gas_costs >= gas.max_event_gas {
            return Err(RulesError::Invalid(
                "UpperBoundForRuleChangeGasCosts must be below MaxEventGas",
            ));
        }
        if gas.event_gas + gas.parent_gas * self.dag.max_parents as u64 > gas.max_event_gas {
            return Err(RulesError::Invalid(
                "an event with MaxParents parents must fit into MaxEventGas",
            ));
        }
        if self.dag.max_parents < 2 {
            return Err(RulesError::Invalid("MaxParents must be at least 2"));
        }
        if self.dag.max_free_parents > self.dag.max_parents {
            return Err(RulesError::Invalid("MaxFreeParents exceeds MaxParents"));
        }
        if self.emitter.interval.is_zero() {
            return Err(RulesError::Invalid("emitter Interval must be positive"));
        }
        if self.blocks.max_block_gas == 0 {
            return Err(RulesError::Invalid("MaxBlockGas must be positive"));
        }
        if self.epochs.max_epoch_frames < 2 {
            return Err(RulesError::Invalid("MaxEpochFrames must be at least 2"));
        }
        Ok(())
    }
}

/// Recursively merges `patch` into `target`: objects merge key by key, any
/// other value replaces what was there.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if value.is_object() => merge_json(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
