//! Calls to the network driver contract.
//!
//! Only the genesis `driver_owner` may call the driver. Accepted calls become
//! [`GovernanceAction`]s that the epoch manager applies after the block.

use alloy_primitives::{Bytes, Log, U256};
use alloy_sol_types::{SolEvent, SolInterface, sol};
use serde_json::Value;
use sonic_chainspec::{Rules, constants::DRIVER_AUTH_ADDRESS};
use sonic_primitives::ValidatorId;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface INodeDriver {
        /// Posts a JSON diff of the network rules, applied at the next epoch.
        function updateNetworkRules(bytes diff) external;
        /// Seals the current epoch at the end of the block, `num` times.
        function advanceEpochs(uint256 num) external;
        /// Sets a validator's weight for the next epoch; zero removes it.
        function updateValidatorWeight(uint256 validatorId, uint256 weight) external;

        event UpdateNetworkRules(bytes diff);
        event AdvanceEpochs(uint256 num);
        event UpdateValidatorWeight(uint256 indexed validatorId, uint256 weight);
    }
}

/// Fixed execution cost of a driver call.
pub const DRIVER_CALL_GAS: u64 = 20_000;

/// Cost of every byte of a rules diff.
pub const RULES_DIFF_BYTE_GAS: u64 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GovernanceAction {
    UpdateRules(Value),
    AdvanceEpochs(u64),
    UpdateValidatorWeight { validator: ValidatorId, weight: u64 },
}

/// Why a driver call reverted; the message becomes the revert data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("caller is not the driver owner")]
    NotOwner,
    #[error("unknown driver call")]
    UnknownCall,
    #[error("rules diff is not valid JSON")]
    DiffNotJson,
    #[error("rules diff does not apply: {0}")]
    InvalidDiff(String),
    #[error("rules update costs {cost} gas, more than the bound of {bound}")]
    DiffTooExpensive { cost: u64, bound: u64 },
    #[error("argument does not fit")]
    Overflow,
}

impl DriverError {
    pub fn revert_data(&self) -> Bytes {
        Bytes::from(self.to_string().into_bytes())
    }
}

/// A decoded and validated driver call.
#[derive(Debug)]
pub struct DriverCall {
    pub action: GovernanceAction,
    /// Execution gas on top of the intrinsic cost.
    pub gas: u64,
    pub log: Log,
}

/// Decodes `input` and validates it against the current `rules`.
pub fn decode_call(input: &[u8], rules: &Rules) -> Result<DriverCall, DriverError> {
    let call = INodeDriver::INodeDriverCalls::abi_decode(input).map_err(|_| DriverError::UnknownCall)?;
    let (action, gas, data) = match call {
        INodeDriver::INodeDriverCalls::updateNetworkRules(call) => {
            let diff: Value =
                serde_json::from_slice(&call.diff).map_err(|_| DriverError::DiffNotJson)?;
            rules
                .merge(&diff)
                .map_err(|err| DriverError::InvalidDiff(err.to_string()))?;
            let cost = DRIVER_CALL_GAS + RULES_DIFF_BYTE_GAS * call.diff.len() as u64;
            let bound = rules.economy.gas.upper_bound_for_rule_change_gas_costs;
            if cost > bound {
                return Err(DriverError::DiffTooExpensive { cost, bound });
            }
            let data = INodeDriver::UpdateNetworkRules { diff: call.diff }.encode_log_data();
            (GovernanceAction::UpdateRules(diff), cost, data)
        }
        INodeDriver::INodeDriverCalls::advanceEpochs(call) => {
            let num = to_u64(call.num)?;
            let data = INodeDriver::AdvanceEpochs { num: call.num }.encode_log_data();
            (GovernanceAction::AdvanceEpochs(num), DRIVER_CALL_GAS, data)
        }
        INodeDriver::INodeDriverCalls::updateValidatorWeight(call) => {
            let validator = ValidatorId::try_from(call.validatorId).map_err(|_| DriverError::Overflow)?;
            let weight = to_u64(call.weight)?;
            let data = INodeDriver::UpdateValidatorWeight {
                validatorId: call.validatorId,
                weight: call.weight,
            }
            .encode_log_data();
            (
                GovernanceAction::UpdateValidatorWeight { validator, weight },
                DRIVER_CALL_GAS,
                data,
            )
        }
    };
    Ok(DriverCall {
        action,
        gas,
        log: Log {
            address: DRIVER_AUTH_ADDRESS,
            data,
        },
    })
}

fn to_u64(value: U256) -> Result<u64, DriverError> {
    u64::try_from(value).map_err(|_| DriverError::Overflow)
}

#[cfg(test)]
mod tests {
    use alloy_sol_types::SolCall;
    use sonic_chainspec::Upgrades;

    use super::*;

    fn rules() -> Rules {
        Rules::fakenet(4003, Upgrades::sonic())
    }

    #[test]
    fn decodes_rules_update() {
        let diff = br#"{"Blocks":{"MaxEmptyBlockSkipPeriod":4000000000}}"#;
        let input = INodeDriver::updateNetworkRulesCall {
            diff: Bytes::from_static(diff),
        }
        .abi_encode();
        let call = decode_call(&input, &rules()).unwrap();
        assert_eq!(
            call.action,
            GovernanceAction::UpdateRules(serde_json::from_slice(diff).unwrap())
        );
        assert_eq!(call.gas, DRIVER_CALL_GAS + RULES_DIFF_BYTE_GAS * diff.len() as u64);
        assert_eq!(call.log.address, DRIVER_AUTH_ADDRESS);
        assert_eq!(call.log.topics()[0], INodeDriver::UpdateNetworkRules::SIGNATURE_HASH);
    }

    #[test]
    fn decodes_weight_and_epoch_calls() {
        let input = INodeDriver::updateValidatorWeightCall {
            validatorId: U256::from(3),
            weight: U256::ZERO,
        }
        .abi_encode();
        assert_eq!(
            decode_call(&input, &rules()).unwrap().action,
            GovernanceAction::UpdateValidatorWeight {
                validator: 3,
                weight: 0
            }
        );

        let input = INodeDriver::advanceEpochsCall { num: U256::from(1) }.abi_encode();
        assert_eq!(
            decode_call(&input, &rules()).unwrap().action,
            GovernanceAction::AdvanceEpochs(1)
        );
    }

    #[test]
    fn rejects_bad_calls() {
        assert_eq!(
            decode_call(&[1, 2, 3, 4], &rules()).unwrap_err(),
            DriverError::UnknownCall
        );

        let not_json = INodeDriver::updateNetworkRulesCall {
            diff: Bytes::from_static(b"{"),
        }
        .abi_encode();
        assert_eq!(
            decode_call(&not_json, &rules()).unwrap_err(),
            DriverError::DiffNotJson
        );

        let unknown_key = INodeDriver::updateNetworkRulesCall {
            diff: Bytes::from_static(br#"{"Blocks":{"Nope":1}}"#),
        }
        .abi_encode();
        assert!(matches!(
            decode_call(&unknown_key, &rules()),
            Err(DriverError::InvalidDiff(_))
        ));

        let mut tight = rules();
        tight.economy.gas.upper_bound_for_rule_change_gas_costs = DRIVER_CALL_GAS;
        let input = INodeDriver::updateNetworkRulesCall {
            diff: Bytes::from_static(b"{}"),
        }
        .abi_encode();
        assert!(matches!(
            decode_call(&input, &tight),
            Err(DriverError::DiffTooExpensive { .. })
        ));
    }
}
