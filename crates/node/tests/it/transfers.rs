//! Transfers reach every validator and survive a restart.

use alloy_eips::{BlockNumberOrTag, eip2718::Encodable2718 as _};
use alloy_primitives::{B256, U256};
use sonic_chainspec::Upgrades;
use sonic_node::{
    fakenet::{DEFAULT_STEP, FakeNet, FakeNetError},
    ingress::SubmitError,
    rpc::{EthApiServer as _, EthRpc, types::BlockTransactions},
    store::TxLocation,
    txpool::PoolError,
};

use crate::utils::{PATIENCE, SENDER, fake_genesis, included_everywhere, recipient, submit, transfer};

#[test]
fn transfers_are_served_after_a_restart() -> eyre::Result<()> {
    let mut net = FakeNet::new(fake_genesis(Upgrades::sonic())?)?;
    let mut hashes = Vec::new();
    for nonce in 0..10 {
        hashes.push(submit(&mut net, 0, &transfer(SENDER, nonce)?)?);
    }
    assert!(net.run_until(DEFAULT_STEP, PATIENCE, |net| included_everywhere(net, &hashes))?);

    let store = &net.node(0).expect("node 0 runs").storage().store;
    let located = hashes
        .iter()
        .map(|hash| Ok(store.tx_location(hash)?.expect("included")))
        .collect::<eyre::Result<Vec<TxLocation>>>()?;
    let head = net.head(0).expect("node 0 runs");

    net.restart(0)?;
    assert_eq!(net.head(0), Some(head.clone()));

    let eth = EthRpc::new(net.rpc(0).expect("node 0 runs"));
    for (hash, location) in hashes.iter().zip(&located) {
        let block = eth
            .block_by_number(BlockNumberOrTag::Number(location.block), true)?
            .expect("block is stored");
        let BlockTransactions::Full(txs) = block.transactions else {
            panic!("full block requested");
        };
        let served: B256 = *txs[location.index as usize].inner.tx_hash();
        assert_eq!(served, *hash);
    }
    assert_eq!(eth.balance(recipient(), None)?, U256::from(10));
    assert_eq!(eth.transaction_count(recipient(), None)?.to::<u64>(), 0);

    for number in 1..=head.number {
        let ours = store_block(&net, 0, number)?;
        for idx in 1..net.len() {
            assert_eq!(store_block(&net, idx, number)?, ours, "block {number} of node {idx}");
        }
    }
    Ok(())
}

#[test]
fn duplicate_submissions_are_rejected() -> eyre::Result<()> {
    let mut net = FakeNet::new(fake_genesis(Upgrades::sonic())?)?;
    let tx = transfer(SENDER, 0)?;
    let hash = submit(&mut net, 0, &tx)?;
    let again = net.submit(1, &tx.encoded_2718());
    assert!(
        matches!(again, Err(FakeNetError::Submit(SubmitError::Pool(PoolError::AlreadyKnown(known)))) if known == hash),
        "{again:?}"
    );
    assert!(net.run_until(DEFAULT_STEP, PATIENCE, |net| included_everywhere(net, &[hash]))?);
    Ok(())
}

fn store_block(net: &FakeNet, idx: usize, number: u64) -> eyre::Result<B256> {
    let store = &net.node(idx).expect("node runs").storage().store;
    Ok(store.block(number)?.expect("block is stored").hash())
}
