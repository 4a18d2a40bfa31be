mod check;
mod genesis;
mod run;

use std::{
    path::{Path, PathBuf},
    str::FromStr as _,
};

use alloy_primitives::Address;
use eyre::{OptionExt as _, WrapErr as _};
use sonic_chainspec::{Genesis, SignedGenesis, genesis::FakeGenesis};
use sonic_node_config::Config;

use crate::Failure;

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Command {
    /// Runs the node until interrupted.
    Run(run::Run),
    /// Creates or inspects genesis files.
    #[command(subcommand)]
    Genesis(genesis::Genesis),
    /// Opens a data directory and checks that chain and state agree.
    Check(check::Check),
}

impl Command {
    pub(crate) fn run(self) -> Result<(), Failure> {
        match self {
            Self::Run(cmd) => cmd.run(),
            Self::Genesis(cmd) => cmd.run().map_err(Failure::from),
            Self::Check(cmd) => cmd.run(),
        }
    }
}

/// Where the configuration comes from; shared by commands that open a data
/// directory.
#[derive(Debug, clap::Args)]
pub(crate) struct ConfigArgs {
    /// TOML configuration file. Flags override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root of the data directory.
    #[arg(long, value_name = "DIR", required_unless_present = "config")]
    datadir: Option<PathBuf>,
}

impl ConfigArgs {
    pub(crate) fn load(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::read_from_file(path)
                .wrap_err_with(|| format!("failed reading config `{}`", path.display()))?,
            None => {
                let datadir = self.datadir.clone().ok_or_eyre("either --config or --datadir is required")?;
                Config::new(datadir)
            }
        };
        if let Some(datadir) = &self.datadir {
            config.datadir = datadir.clone();
        }
        Ok(config)
    }
}

/// Resolves `fake:<validators>[:<upgrades>]` or the path of a signed JSON
/// genesis, which must be signed by `trusted`.
pub(crate) fn load_genesis(source: &str, trusted: Option<Address>) -> eyre::Result<Genesis> {
    if source.starts_with("fake:") {
        return FakeGenesis::from_str(source)
            .and_then(|fake| fake.build())
            .wrap_err_with(|| format!("failed building fake genesis `{source}`"));
    }
    let trusted = trusted.ok_or_eyre("a JSON genesis requires --genesis.trusted")?;
    SignedGenesis::read(Path::new(source))
        .and_then(|signed| signed.verify(trusted))
        .wrap_err_with(|| format!("failed loading genesis `{source}`"))
}

#[cfg(test)]
mod tests {
    use sonic_chainspec::genesis::fake::fake_key;

    use super::*;

    #[test]
    fn loads_fake_and_signed_genesis() {
        let fake = load_genesis("fake:2:sonic+allegro", None).unwrap();
        assert_eq!(fake.validators.len(), 2);
        assert!(fake.rules.upgrades.allegro);
        assert!(load_genesis("fake:0", None).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        let signer = fake_key(1).unwrap();
        SignedGenesis::sign(fake.clone(), &signer).unwrap().write(&path).unwrap();
        let source = path.to_str().unwrap();
        assert!(load_genesis(source, None).is_err());
        assert_eq!(load_genesis(source, Some(signer.address())).unwrap(), fake);
        assert!(load_genesis(source, Some(Address::repeat_byte(1))).is_err());
    }
}
