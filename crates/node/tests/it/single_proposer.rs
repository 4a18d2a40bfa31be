//! A single elected proposer per block keeps up with a steady transaction load.

use std::time::Duration;

use sonic_chainspec::{
    Rules, Upgrades,
    genesis::{FAKE_NETWORK_ID, FakeGenesis},
};
use sonic_node::fakenet::{DEFAULT_STEP, FakeNet};

use crate::utils::{PATIENCE, included_everywhere, receipt, submit, transfer};

const ROUNDS: u64 = 30;

#[test]
fn proposers_include_every_round_in_few_blocks() -> eyre::Result<()> {
    let upgrades = Upgrades::allegro().with_single_proposer();
    let mut rules = Rules::fakenet(FAKE_NETWORK_ID, upgrades);
    rules.blocks.max_empty_block_skip_period = Duration::from_secs(10);
    let genesis = FakeGenesis::new(3, upgrades).build_with_rules(rules)?;
    let mut net = FakeNet::new(genesis)?;
    let start = net.head(0).expect("node 0 runs").number;

    let mut hashes = Vec::new();
    for round in 0..ROUNDS {
        let submitted = (4..=8)
            .map(|key| submit(&mut net, round as usize % 3, &transfer(key, round)?))
            .collect::<eyre::Result<Vec<_>>>()?;
        assert!(
            net.run_until(DEFAULT_STEP, PATIENCE, |net| included_everywhere(net, &submitted))?,
            "round {round} was not included"
        );
        hashes.extend(submitted);
    }

    for hash in &hashes {
        assert!(receipt(&net, 0, hash)?.status, "transaction {hash} failed");
    }
    let produced = net.head(0).expect("node 0 runs").number - start;
    assert!(produced <= 2 * ROUNDS, "{produced} blocks for {ROUNDS} rounds");
    assert!(
        net.committed(0)
            .iter()
            .all(|committed| committed.block.proposer() != 0)
    );
    Ok(())
}
