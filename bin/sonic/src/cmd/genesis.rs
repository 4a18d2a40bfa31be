use std::path::PathBuf;

use alloy_primitives::Address;
use eyre::WrapErr as _;
use sonic_chainspec::{Genesis as ChainGenesis, SignedGenesis, Upgrades, genesis::FakeGenesis};

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Genesis {
    /// Prints the genesis of a local network with deterministic keys.
    Fake {
        /// Number of validators.
        validators: u32,

        /// `+`-separated upgrades, e.g. `sonic+allegro+single-proposer`.
        #[arg(long, default_value = "sonic", value_parser = Upgrades::parse_list)]
        upgrades: Upgrades,

        /// Writes the genesis to this file instead of standard output.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Verifies a signed JSON genesis and prints its hash and validators.
    Json {
        path: PathBuf,

        /// Address the genesis must be signed by.
        #[arg(long, value_name = "ADDRESS")]
        trusted: Address,
    },
}

impl Genesis {
    pub(crate) fn run(self) -> eyre::Result<()> {
        match self {
            Self::Fake {
                validators,
                upgrades,
                out,
            } => {
                let genesis = FakeGenesis::new(validators, upgrades)
                    .build()
                    .wrap_err("failed building fake genesis")?;
                let json = serde_json::to_string_pretty(&genesis)?;
                match out {
                    Some(path) => std::fs::write(&path, json)
                        .wrap_err_with(|| format!("failed writing `{}`", path.display()))?,
                    None => println!("{json}"),
                }
                Ok(())
            }
            Self::Json { path, trusted } => {
                let genesis = SignedGenesis::read(&path)
                    .and_then(|signed| signed.verify(trusted))
                    .wrap_err_with(|| format!("failed verifying `{}`", path.display()))?;
                println!("{}", serde_json::to_string_pretty(&summary(&genesis)?)?);
                Ok(())
            }
        }
    }
}

fn summary(genesis: &ChainGenesis) -> eyre::Result<serde_json::Value> {
    Ok(serde_json::json!({
        "hash": genesis.hash()?,
        "networkId": genesis.rules.network_id,
        "upgrades": genesis.rules.upgrades,
        "driverOwner": genesis.driver_owner,
        "validators": genesis.validators,
        "accounts": genesis.accounts.len(),
    }))
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::*;
    use crate::{Cli, cmd::Command};

    fn parse(args: &[&str]) -> Genesis {
        let cli = Cli::try_parse_from(["sonic", "genesis"].iter().chain(args)).unwrap();
        let Command::Genesis(genesis) = cli.command else {
            panic!("parsed another command");
        };
        genesis
    }

    #[test]
    fn writes_fake_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("genesis.json");
        parse(&["fake", "4", "--upgrades", "sonic+allegro", "--out", out.to_str().unwrap()])
            .run()
            .unwrap();

        let written: ChainGenesis =
            serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(written, FakeGenesis::new(4, Upgrades::allegro()).build().unwrap());
        assert!(Cli::try_parse_from(["sonic", "genesis", "fake", "3", "--upgrades", "nope"]).is_err());
    }
}
