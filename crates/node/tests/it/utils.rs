use std::time::Duration;

use alloy_consensus::{TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718 as _;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use sonic_chainspec::{
    Genesis, Upgrades,
    constants::DRIVER_AUTH_ADDRESS,
    genesis::{FAKE_NETWORK_ID, FakeGenesis, fake::fake_key},
};
use sonic_node::fakenet::FakeNet;
use sonic_primitives::{Receipt, sign_transaction};

/// Sender of plain transfers; not a validator.
pub(crate) const SENDER: u32 = 5;

/// Owner of the node driver in fake genesis files.
pub(crate) const DRIVER_OWNER: u32 = 1;

/// Upper bound of clock time any scenario waits for.
pub(crate) const PATIENCE: Duration = Duration::from_secs(120);

pub(crate) fn recipient() -> Address {
    Address::repeat_byte(0x42)
}

pub(crate) fn fake_genesis(upgrades: Upgrades) -> eyre::Result<Genesis> {
    Ok(FakeGenesis::new(3, upgrades).build()?)
}

pub(crate) fn legacy_tx(
    key: u32,
    nonce: u64,
    to: Address,
    value: U256,
    input: Bytes,
    gas_limit: u64,
) -> eyre::Result<TxEnvelope> {
    let tx = TxLegacy {
        chain_id: Some(FAKE_NETWORK_ID),
        nonce,
        gas_price: 2_000_000_000,
        gas_limit,
        to: TxKind::Call(to),
        value,
        input,
    };
    Ok(sign_transaction(tx, &fake_key(key)?)?)
}

pub(crate) fn transfer(key: u32, nonce: u64) -> eyre::Result<TxEnvelope> {
    legacy_tx(key, nonce, recipient(), U256::from(1), Bytes::new(), 21_000)
}

/// A call of the node driver by its owner.
pub(crate) fn driver_call(nonce: u64, input: Vec<u8>) -> eyre::Result<TxEnvelope> {
    legacy_tx(
        DRIVER_OWNER,
        nonce,
        DRIVER_AUTH_ADDRESS,
        U256::ZERO,
        input.into(),
        1_000_000,
    )
}

pub(crate) fn submit(net: &mut FakeNet, idx: usize, tx: &TxEnvelope) -> eyre::Result<B256> {
    Ok(net.submit(idx, &tx.encoded_2718())?)
}

/// Whether node `idx` holds all of `hashes` in its chain.
pub(crate) fn included(net: &FakeNet, idx: usize, hashes: &[B256]) -> bool {
    let Some(core) = net.node(idx) else {
        return false;
    };
    let store = &core.storage().store;
    hashes
        .iter()
        .all(|hash| matches!(store.tx_location(hash), Ok(Some(_))))
}

pub(crate) fn included_everywhere(net: &FakeNet, hashes: &[B256]) -> bool {
    (0..net.len()).all(|idx| included(net, idx, hashes))
}

pub(crate) fn receipt(net: &FakeNet, idx: usize, hash: &B256) -> eyre::Result<Receipt> {
    let store = &net
        .node(idx)
        .ok_or_else(|| eyre::eyre!("node {idx} is not running"))?
        .storage()
        .store;
    let location = store
        .tx_location(hash)?
        .ok_or_else(|| eyre::eyre!("transaction {hash} is not in the chain"))?;
    let receipts = store
        .receipts(location.block)?
        .ok_or_else(|| eyre::eyre!("block {} has no receipts", location.block))?;
    receipts
        .get(location.index as usize)
        .cloned()
        .ok_or_else(|| eyre::eyre!("receipt {} of block {} is missing", location.index, location.block))
}
