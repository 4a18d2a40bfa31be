//! Data-heavy transactions pay at least the calldata floor from Allegro on.

use alloy_primitives::{Bytes, U256};
use sonic_chainspec::Upgrades;
use sonic_evm::gas::floor_data_gas;
use sonic_node::fakenet::{DEFAULT_STEP, FakeNet};

use crate::utils::{PATIENCE, SENDER, fake_genesis, included, legacy_tx, receipt, recipient, submit};

fn calldata() -> Bytes {
    let mut data = vec![0xff; 40_000];
    data[0] = 0x00;
    data.into()
}

/// Gas charged for the calldata-heavy transaction under `upgrades`.
fn gas_used(upgrades: Upgrades) -> eyre::Result<u64> {
    let mut net = FakeNet::new(fake_genesis(upgrades)?)?;
    let tx = legacy_tx(SENDER, 0, recipient(), U256::from(1), calldata(), 2_000_000)?;
    let hash = submit(&mut net, 0, &tx)?;
    assert!(net.run_until(DEFAULT_STEP, PATIENCE, |net| included(net, 0, &[hash]))?);

    let receipt = receipt(&net, 0, &hash)?;
    assert!(receipt.status);
    Ok(receipt.gas_used)
}

#[test]
fn allegro_charges_the_calldata_floor() -> eyre::Result<()> {
    let floor = floor_data_gas(&calldata());
    let allegro = gas_used(Upgrades::allegro())?;
    assert!(allegro >= floor, "{allegro} is below the floor {floor}");

    let sonic = gas_used(Upgrades::sonic())?;
    assert!(sonic < allegro, "sonic charged {sonic}, allegro {allegro}");
    assert!(sonic < floor);
    Ok(())
}
