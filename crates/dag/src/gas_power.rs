//! Gas power: a regenerating allowance bounding how much gas a validator's
//! events may carry.
//!
//! Two windows run side by side. Each refills linearly at the validator's share
//! of `AllocPerSec` (proportional to stake), is capped at `MaxAllocPeriod`
//! worth of refill, and starts the epoch with `StartupAllocPeriod` worth of
//! refill but never less than `MinStartupGas`. An event must fit into both.

use std::time::Duration;

use sonic_chainspec::{Rules, rules::GasPowerRules};
use sonic_primitives::{Stake, Timestamp, UnsignedEvent, Validators};

use crate::AdmissionError;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Gas power left after an event, per window (short, long).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasPowerLeft(pub [u64; 2]);

impl GasPowerLeft {
    pub fn min(&self) -> u64 {
        self.0[0].min(self.0[1])
    }
}

/// Gas an event has to pay for: a base cost, a cost per parent beyond the free
/// ones, and the gas limits of every carried transaction.
pub fn event_gas(rules: &Rules, event: &UnsignedEvent) -> u64 {
    let gas = &rules.economy.gas;
    let parents = event.other_parents().len() + usize::from(event.self_parent().is_some());
    let paid_parents = parents.saturating_sub(rules.dag.max_free_parents as usize) as u64;
    let proposal_txs = event
        .payload
        .proposal()
        .map(|proposal| proposal.transactions.as_slice())
        .unwrap_or_default();
    let txs = event
        .payload
        .transactions()
        .iter()
        .chain(proposal_txs)
        .fold(0u64, |acc, tx| {
            acc.saturating_add(alloy_consensus::Transaction::gas_limit(tx))
        });
    gas.event_gas
        .saturating_add(gas.parent_gas.saturating_mul(paid_parents))
        .saturating_add(txs)
}

#[derive(Clone, Copy, Debug)]
struct Allowance {
    rate_per_sec: u128,
    cap: u64,
    startup: u64,
}

impl Allowance {
    fn new(rules: &GasPowerRules, stake: Stake, total: Stake) -> Self {
        let rate_per_sec = if total == 0 {
            0
        } else {
            rules.alloc_per_sec as u128 * stake as u128 / total as u128
        };
        let refill = |period: Duration| saturate(rate_per_sec * period.as_nanos() / NANOS_PER_SEC);
        Self {
            rate_per_sec,
            cap: refill(rules.max_alloc_period),
            startup: refill(rules.startup_alloc_period).max(rules.min_startup_gas),
        }
    }

    fn refill(&self, elapsed: Duration) -> u64 {
        saturate(self.rate_per_sec * elapsed.as_nanos() / NANOS_PER_SEC)
    }

    fn available(&self, previous: Option<(u64, Duration)>) -> u64 {
        match previous {
            None => self.startup,
            Some((left, elapsed)) => left
                .saturating_add(self.refill(elapsed))
                .min(self.cap.max(left)),
        }
    }
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Per-validator gas power parameters of one epoch.
#[derive(Clone, Debug)]
pub struct GasPower {
    allowances: Vec<[Allowance; 2]>,
}

impl GasPower {
    pub fn new(rules: &Rules, validators: &Validators) -> Self {
        let total = validators.total_stake();
        let allowances = validators
            .iter()
            .map(|(_, stake)| {
                [
                    Allowance::new(&rules.economy.short_gas_power, stake, total),
                    Allowance::new(&rules.economy.long_gas_power, stake, total),
                ]
            })
            .collect();
        Self { allowances }
    }

    /// Gas power available to the next event of validator `creator_idx`.
    ///
    /// `previous` is the gas left after the creator's previous event together
    /// with that event's creation time; `None` for the first event of the epoch.
    pub fn available(
        &self,
        creator_idx: usize,
        previous: Option<(GasPowerLeft, Timestamp)>,
        now: Timestamp,
    ) -> GasPowerLeft {
        let Some(allowance) = self.allowances.get(creator_idx) else {
            return GasPowerLeft::default();
        };
        let window = |w: usize| {
            allowance[w].available(previous.map(|(left, at)| (left.0[w], now.saturating_sub(at))))
        };
        GasPowerLeft([window(0), window(1)])
    }

    /// Deducts `used` from the available gas power, failing if either window
    /// runs short.
    pub fn charge(
        &self,
        creator_idx: usize,
        previous: Option<(GasPowerLeft, Timestamp)>,
        now: Timestamp,
        used: u64,
    ) -> Result<GasPowerLeft, AdmissionError> {
        let available = self.available(creator_idx, previous, now);
        if used > available.min() {
            return Err(AdmissionError::GasOverrun {
                used,
                available: available.min(),
            });
        }
        Ok(GasPowerLeft([available.0[0] - used, available.0[1] - used]))
    }
}
