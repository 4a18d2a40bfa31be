//! Rules changed through the driver pace empty blocks from the next epoch on.

use std::time::Duration;

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolCall as _;
use sonic_chainspec::Upgrades;
use sonic_evm::driver::INodeDriver;
use sonic_node::fakenet::{DEFAULT_STEP, FakeNet};

use crate::utils::{PATIENCE, driver_call, fake_genesis, submit};

const SKIP_PERIOD: Duration = Duration::from_secs(4);

#[test]
fn idle_chain_spaces_empty_blocks_by_the_new_skip_period() -> eyre::Result<()> {
    let mut net = FakeNet::new(fake_genesis(Upgrades::sonic())?)?;
    let diff = br#"{"Blocks":{"MaxEmptyBlockSkipPeriod":4000000000}}"#;
    let update = INodeDriver::updateNetworkRulesCall { diff: Bytes::from_static(diff) }.abi_encode();
    let advance = INodeDriver::advanceEpochsCall { num: U256::from(1) }.abi_encode();
    submit(&mut net, 0, &driver_call(0, update)?)?;
    submit(&mut net, 0, &driver_call(1, advance)?)?;

    assert!(net.run_until(DEFAULT_STEP, PATIENCE, |net| {
        (0..net.len()).all(|idx| {
            net.node(idx)
                .is_some_and(|core| core.storage().store.epoch_state().epoch >= 2)
        })
    })?);
    for idx in 0..net.len() {
        let state = net.node(idx).expect("node runs").storage().store.epoch_state();
        assert_eq!(state.rules.blocks.max_empty_block_skip_period, SKIP_PERIOD);
    }

    let seen = net.committed(0).len();
    net.run_for(Duration::from_secs(20), DEFAULT_STEP)?;
    let idle: Vec<_> = net.committed(0)[seen..]
        .iter()
        .map(|committed| &committed.block)
        .collect();
    assert!(idle.len() >= 3, "only {} blocks in 20s", idle.len());
    assert!(idle.iter().all(|block| block.is_empty() && block.epoch() >= 2));
    for pair in idle.windows(2) {
        let delta = pair[1].timestamp().saturating_sub(pair[0].timestamp());
        assert!(
            (SKIP_PERIOD..SKIP_PERIOD + Duration::from_secs(1)).contains(&delta),
            "blocks {} and {} are {delta:?} apart",
            pair[0].number(),
            pair[1].number()
        );
    }
    Ok(())
}
