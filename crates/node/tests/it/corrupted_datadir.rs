//! A node whose chain database is corrupted refuses to start and stays locked.

use std::time::Duration;

use sonic_chainspec::Upgrades;
use sonic_kvdb::{DataDir, Producer as _, SledProducer, Table as _};
use sonic_node::{Fatal, fakenet::FakeNet};

use crate::utils::fake_genesis;

#[test]
fn corrupted_head_locks_the_datadir() -> eyre::Result<()> {
    let root = tempfile::tempdir()?;
    let mut net = FakeNet::with_datadirs(fake_genesis(Upgrades::sonic())?, root.path())?;
    assert!(net.run_until_block(2, Duration::from_secs(60))?);
    net.stop(0);

    let datadir = DataDir::new(root.path().join("node1"));
    {
        let chaindata = SledProducer::open(&datadir.chaindata())?;
        chaindata.open_table("main")?.put(b"head", b"not a chain head")?;
        chaindata.sync()?;
    }

    let err = net.restart(0).expect_err("a corrupted head must not load");
    assert!(matches!(err, Fatal::Storage(_)), "{err:?}");
    assert!(net.node(0).is_none());
    let message = std::fs::read_to_string(datadir.errlock())?;
    assert!(!message.trim().is_empty());

    let err = net.restart(0).expect_err("the errlock must refuse the start");
    assert!(matches!(err, Fatal::Locked(_)), "{err:?}");
    assert_eq!(std::fs::read_to_string(datadir.errlock())?, message);
    assert!(net.head(1).is_some());
    Ok(())
}
