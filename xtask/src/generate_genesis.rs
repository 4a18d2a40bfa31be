use std::path::{Path, PathBuf};

use alloy_primitives::{U256, utils::parse_ether};
use alloy_signer_local::PrivateKeySigner;
use eyre::WrapErr as _;
use rand::{SeedableRng as _, rngs::StdRng};
use sonic_chainspec::{Genesis, GenesisAccount, Rules, SignedGenesis, Upgrades};
use sonic_node_config::{BlsKey, Config, EventKey, ValidatorConfig};
use sonic_primitives::{Timestamp, ValidatorProfile};
use sonic_scc::BlsSecretKey;

/// File the genesis is signed with, next to the output, when no key is given.
const SIGNER_FILE: &str = "genesis.signer";

#[derive(clap::Parser, Debug)]
pub(crate) struct GenerateGenesis {
    /// Output file path of the signed genesis.
    #[arg(short, long)]
    output: PathBuf,

    /// Number of validators.
    #[arg(long, default_value_t = 4)]
    validators: u32,

    /// Weight of every validator.
    #[arg(long, default_value_t = 1_000_000)]
    weight: u64,

    #[arg(long, default_value_t = 0xfa)]
    network_id: u64,

    /// `+`-separated upgrades, e.g. `sonic+allegro`.
    #[arg(long, default_value = "sonic+allegro", value_parser = Upgrades::parse_list)]
    upgrades: Upgrades,

    /// Balance in ether of every validator's account.
    #[arg(long, default_value = "1000000")]
    balance: String,

    /// Genesis time in unix seconds; defaults to now.
    #[arg(long)]
    time: Option<u64>,

    /// Hex file with the key that signs the genesis and owns the driver.
    /// A fresh key is written to `genesis.signer` when omitted.
    #[arg(long, value_name = "FILE")]
    signer_key: Option<PathBuf>,

    /// Seed for reproducible keys.
    #[arg(long)]
    seed: Option<u64>,
}

impl GenerateGenesis {
    pub(crate) fn run(self) -> eyre::Result<()> {
        eyre::ensure!(self.validators > 0, "at least one validator is required");
        let dir = self
            .output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let balance: U256 = parse_ether(&self.balance)
            .wrap_err_with(|| format!("invalid balance `{}`", self.balance))?;

        let signer = match &self.signer_key {
            Some(path) => EventKey::read_from_file(path)
                .wrap_err_with(|| format!("failed reading signer key `{}`", path.display()))?,
            None => {
                let key = EventKey::from(PrivateKeySigner::random_with(&mut rng));
                let path = dir.join(SIGNER_FILE);
                key.write_to_file(&path)
                    .wrap_err_with(|| format!("failed writing signer key `{}`", path.display()))?;
                key
            }
        };

        let mut validators = Vec::new();
        let mut accounts = Vec::new();
        for id in 1..=self.validators {
            let event_key = EventKey::from(PrivateKeySigner::random_with(&mut rng));
            let bls_key = BlsKey::from(BlsSecretKey::random(&mut rng));
            let files = ValidatorConfig {
                id,
                event_key: PathBuf::from(format!("validator-{id}.event")),
                bls_key: PathBuf::from(format!("validator-{id}.bls")),
            };
            write_keys(&dir, &files, &event_key, &bls_key)?;

            let mut config = Config::new(format!("node{id}"));
            config.genesis = Some(self.output.display().to_string());
            config.validator = Some(files);
            let config_path = dir.join(format!("validator-{id}.toml"));
            config
                .write_to_file(&config_path)
                .wrap_err_with(|| format!("failed writing config `{}`", config_path.display()))?;

            validators.push(ValidatorProfile {
                id,
                address: event_key.address(),
                weight: self.weight,
                bls_key: bls_key.public_key().to_bytes(),
            });
            accounts.push(GenesisAccount {
                address: event_key.address(),
                balance,
                nonce: 0,
            });
        }

        let genesis = Genesis {
            time: self
                .time
                .map_or_else(Timestamp::now, Timestamp::from_secs),
            driver_owner: signer.address(),
            rules: Rules::fakenet(self.network_id, self.upgrades),
            validators,
            accounts,
        };
        genesis.validate().wrap_err("generated genesis is invalid")?;
        let hash = genesis.hash()?;
        let signed = SignedGenesis::sign(genesis, &signer.into_inner())
            .wrap_err("failed signing genesis")?;
        signed
            .write(&self.output)
            .wrap_err_with(|| format!("failed writing genesis to file `{}`", self.output.display()))?;
        println!("genesis {hash} written to `{}`", self.output.display());
        Ok(())
    }
}

fn write_keys(
    dir: &Path,
    files: &ValidatorConfig,
    event_key: &EventKey,
    bls_key: &BlsKey,
) -> eyre::Result<()> {
    let event_path = dir.join(&files.event_key);
    event_key
        .write_to_file(&event_path)
        .wrap_err_with(|| format!("failed writing event key to `{}`", event_path.display()))?;
    let bls_path = dir.join(&files.bls_key);
    bls_key
        .write_to_file(&bls_path)
        .wrap_err_with(|| format!("failed writing BLS key to `{}`", bls_path.display()))?;
    Ok(())
}
