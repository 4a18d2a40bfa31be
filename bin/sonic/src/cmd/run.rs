use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use alloy_primitives::Address;
use eyre::{WrapErr as _, ensure};
use sonic_chainspec::genesis::fake::{fake_bls_key, fake_key};
use sonic_kvdb::DataDir;
use sonic_node::{
    Launch, Node,
    clock::SystemClock,
    launch::{is_initialized, open_datadir, write_errlock},
    network::NoNetwork,
    node_core::ValidatorKeys,
};
use sonic_node_config::{BlsKey, Config, EventKey, ValidatorConfig};
use sonic_primitives::ValidatorId;
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ConfigArgs, load_genesis};
use crate::Failure;

/// Interrupts after which the process exits without waiting for the drain.
const FORCED_EXIT_INTERRUPTS: usize = 10;

#[derive(Debug, clap::Args)]
pub(crate) struct Run {
    #[command(flatten)]
    config: ConfigArgs,

    /// `fake:<validators>[:<upgrades>]` or the path of a signed JSON genesis.
    /// Only read when the data directory is empty.
    #[arg(long, value_name = "GENESIS")]
    genesis: Option<String>,

    /// Address that must have signed a JSON genesis.
    #[arg(long = "genesis.trusted", value_name = "ADDRESS")]
    genesis_trusted: Option<Address>,

    /// Address of the JSON-RPC server.
    #[arg(long = "rpc.listen", value_name = "ADDR")]
    rpc_listen: Option<SocketAddr>,

    /// Runs without the JSON-RPC server.
    #[arg(long = "rpc.disable")]
    rpc_disable: bool,

    #[arg(long = "validator.id", value_name = "ID", requires_all = ["event_key", "bls_key"])]
    validator_id: Option<ValidatorId>,

    /// Hex file with the validator's secp256k1 event key.
    #[arg(long = "validator.event-key", value_name = "FILE", requires = "validator_id")]
    event_key: Option<PathBuf>,

    /// Hex file with the validator's BLS key.
    #[arg(long = "validator.bls-key", value_name = "FILE", requires = "validator_id")]
    bls_key: Option<PathBuf>,

    /// Runs as validator `<ID>` of a fake genesis, with its deterministic keys.
    #[arg(long = "fakenet.validator", value_name = "ID", conflicts_with = "validator_id")]
    fake_validator: Option<ValidatorId>,

    /// Follows the chain without creating events.
    #[arg(long = "emitter.disable")]
    emitter_disable: bool,
}

impl Run {
    pub(crate) fn run(self) -> Result<(), Failure> {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .wrap_err("failed constructing async runtime")?
            .block_on(self.run_async())
    }

    fn config(&self) -> eyre::Result<Config> {
        let mut config = self.config.load()?;
        if let Some(genesis) = &self.genesis {
            config.genesis = Some(genesis.clone());
        }
        if let Some(listen) = self.rpc_listen {
            config.rpc.listen = listen;
        }
        if self.rpc_disable {
            config.rpc.enabled = false;
        }
        if let (Some(id), Some(event_key), Some(bls_key)) =
            (self.validator_id, &self.event_key, &self.bls_key)
        {
            config.validator = Some(ValidatorConfig {
                id,
                event_key: event_key.clone(),
                bls_key: bls_key.clone(),
            });
        }
        if self.emitter_disable {
            config.emitter.enabled = false;
        }
        config.validate().wrap_err("invalid configuration")?;
        Ok(config)
    }

    fn keys(&self, config: &Config) -> eyre::Result<Option<ValidatorKeys>> {
        if let Some(id) = self.fake_validator {
            ensure!(
                config.genesis.as_deref().is_some_and(|genesis| genesis.starts_with("fake:")),
                "--fakenet.validator requires a fake genesis"
            );
            return Ok(Some(ValidatorKeys {
                id,
                event_key: fake_key(id)?,
                bls_key: fake_bls_key(id)?,
            }));
        }
        let Some(validator) = &config.validator else {
            return Ok(None);
        };
        let event_key = EventKey::read_from_file(&validator.event_key).wrap_err_with(|| {
            format!("failed reading event key `{}`", validator.event_key.display())
        })?;
        let bls_key = BlsKey::read_from_file(&validator.bls_key).wrap_err_with(|| {
            format!("failed reading BLS key `{}`", validator.bls_key.display())
        })?;
        Ok(Some(ValidatorKeys {
            id: validator.id,
            event_key: event_key.into_inner(),
            bls_key: bls_key.into_inner(),
        }))
    }

    async fn run_async(self) -> Result<(), Failure> {
        let config = self.config()?;
        let keys = self.keys(&config)?;
        let genesis = match (&config.genesis, is_initialized(&config.datadir)) {
            (Some(source), false) => Some(load_genesis(source, self.genesis_trusted)?),
            (None, false) => {
                return Err(eyre::eyre!(
                    "data directory `{}` is empty and no genesis was given",
                    config.datadir.display()
                )
                .into());
            }
            (_, true) => None,
        };
        let interrupts = Interrupts::new()?;

        let datadir = DataDir::new(&config.datadir);
        let storage = open_datadir(&datadir, genesis.as_ref()).inspect_err(|fatal| {
            write_errlock(&datadir, fatal);
        })?;

        // Without a peer-to-peer transport the inbox stays empty; holding the
        // sender keeps it open.
        let (_gossip, inbox) = mpsc::unbounded_channel();
        let mut node = Node::launch(Launch {
            config,
            storage,
            keys,
            clock: Arc::new(SystemClock),
            network: Arc::new(NoNetwork),
            inbox,
            datadir: Some(datadir),
        })
        .await
        .wrap_err("failed launching node")?;
        if let Some(addr) = node.local_rpc_addr() {
            info!(%addr, "JSON-RPC server listening");
        }

        tokio::spawn(interrupts.escalate(node.stop_token()));
        node.wait().await?;
        Ok(())
    }
}

struct Interrupts {
    sigint: Signal,
    sigterm: Signal,
}

impl Interrupts {
    fn new() -> eyre::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).wrap_err("failed installing SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).wrap_err("failed installing SIGTERM handler")?,
        })
    }

    /// The first interrupt starts a graceful shutdown, the tenth exits at once.
    async fn escalate(mut self, stop: CancellationToken) {
        let mut received = 0;
        loop {
            tokio::select! {
                _ = self.sigint.recv() => info!("received SIGINT"),
                _ = self.sigterm.recv() => info!("received SIGTERM"),
            }
            received += 1;
            if received == 1 {
                info!(
                    force_after = FORCED_EXIT_INTERRUPTS - 1,
                    "shutting down, interrupt again to force"
                );
                stop.cancel();
            } else if received >= FORCED_EXIT_INTERRUPTS {
                warn!("forced exit before the node drained");
                std::process::exit(1);
            } else {
                info!(remaining = FORCED_EXIT_INTERRUPTS - received, "already shutting down");
            }
        }
    }
}
