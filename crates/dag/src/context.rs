use std::{collections::HashMap, sync::Arc};

use alloy_primitives::Address;
use sonic_chainspec::Rules;
use sonic_primitives::{Epoch, Timestamp, ValidatorId, ValidatorProfile, Validators};

/// Everything admission and consensus need to know about the running epoch.
#[derive(Clone, Debug)]
pub struct EpochContext {
    pub epoch: Epoch,
    pub validators: Validators,
    /// Event-signing address of every validator.
    pub addresses: Arc<HashMap<ValidatorId, Address>>,
    pub rules: Arc<Rules>,
    /// Time of the last block of the previous epoch.
    pub start_time: Timestamp,
}

impl EpochContext {
    pub fn new(
        epoch: Epoch,
        profiles: &[ValidatorProfile],
        rules: Rules,
        start_time: Timestamp,
    ) -> Self {
        Self {
            epoch,
            validators: Validators::new(profiles.iter().map(|v| (v.id, v.weight))),
            addresses: Arc::new(
                profiles
                    .iter()
                    .filter(|v| v.weight > 0)
                    .map(|v| (v.id, v.address))
                    .collect(),
            ),
            rules: Arc::new(rules),
            start_time,
        }
    }

    pub fn address_of(&self, validator: ValidatorId) -> Option<Address> {
        self.addresses.get(&validator).copied()
    }
}
