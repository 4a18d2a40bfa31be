//! Served block and committee certificates verify against the right committee.

use alloy_primitives::{U64, U256};
use alloy_sol_types::SolCall as _;
use sonic_chainspec::Upgrades;
use sonic_evm::driver::INodeDriver;
use sonic_node::{
    fakenet::{DEFAULT_STEP, FakeNet},
    rpc::{SonicApiServer as _, SonicRpc, types::NumberOrMax},
};

use crate::utils::{PATIENCE, driver_call, fake_genesis, submit};

#[test]
fn certificates_verify_across_an_epoch_switch() -> eyre::Result<()> {
    let mut net = FakeNet::new(fake_genesis(Upgrades::sonic())?)?;
    let advance = INodeDriver::advanceEpochsCall { num: U256::from(1) }.abi_encode();
    submit(&mut net, 0, &driver_call(0, advance)?)?;
    assert!(net.run_until(DEFAULT_STEP, PATIENCE, |net| {
        net.node(0).is_some_and(|core| {
            let store = &core.storage().store;
            store.epoch_state().epoch >= 2 && store.head().number >= 6
        })
    })?);

    let store = net.node(0).expect("node 0 runs").storage().store.clone();
    let sonic = SonicRpc::new(net.rpc(0).expect("node 0 runs"));

    let blocks = sonic.block_certificates(U64::ZERO, NumberOrMax::Max)?;
    assert!(blocks.len() >= 5, "only {} certified blocks", blocks.len());
    for (number, certificate) in (0u64..).zip(&blocks) {
        let statement = &certificate.statement;
        assert_eq!(statement.number, number);
        let block = store.block(number)?.expect("certified block is stored");
        assert_eq!(statement.hash, block.hash());
        assert_eq!(statement.state_root, block.state_root());
        let committee = store
            .epoch_state_at(block.epoch())?
            .expect("epoch of a stored block is known")
            .committee()?;
        certificate.verify(&committee)?;
    }
    assert!(blocks.iter().any(|certificate| {
        matches!(store.block(certificate.statement.number), Ok(Some(block)) if block.epoch() == 2)
    }));

    let committees = sonic.committee_certificates(U64::from(1), NumberOrMax::Max)?;
    assert!(committees.len() >= 2, "only {} certified committees", committees.len());
    let genesis_committee = net.genesis().committee()?;
    for (epoch, certificate) in (1u32..).zip(&committees) {
        let statement = &certificate.statement;
        assert_eq!(statement.epoch, epoch);
        let own = store.epoch_state_at(epoch)?.expect("epoch is known").committee()?;
        assert_eq!(statement.committee, own);
        let signers = match epoch {
            1 => genesis_committee.clone(),
            _ => store.epoch_state_at(epoch - 1)?.expect("epoch is known").committee()?,
        };
        certificate.verify(&signers)?;
    }

    let window = sonic.block_certificates(U64::from(2), NumberOrMax::Number(3))?;
    assert_eq!(window, blocks[2..=3]);
    Ok(())
}
