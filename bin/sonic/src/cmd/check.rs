use eyre::eyre;
use sonic_kvdb::DataDir;
use sonic_node::launch::{is_initialized, open_datadir, write_errlock};
use tracing::info;

use super::ConfigArgs;
use crate::Failure;

#[derive(Debug, clap::Args)]
pub(crate) struct Check {
    #[command(flatten)]
    config: ConfigArgs,
}

impl Check {
    /// Runs the same consistency checks as a node start. An inconsistent
    /// directory is locked like a failed start would lock it.
    pub(crate) fn run(self) -> Result<(), Failure> {
        let config = self.config.load()?;
        if !is_initialized(&config.datadir) {
            return Err(eyre!("data directory `{}` is not initialized", config.datadir.display()).into());
        }
        let datadir = DataDir::new(&config.datadir);
        let storage = open_datadir(&datadir, None).inspect_err(|fatal| {
            write_errlock(&datadir, fatal);
        })?;

        let head = storage.store.head();
        info!(number = head.number, hash = %head.hash, epoch = head.epoch, "data directory is consistent");
        println!("{}", serde_json::to_string_pretty(&head).map_err(eyre::Report::new)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};

    use super::*;
    use crate::{Cli, cmd::Command};

    fn check(datadir: &std::path::Path) -> Result<(), Failure> {
        let cli = Cli::try_parse_from(["sonic", "check", "--datadir", datadir.to_str().unwrap()]).unwrap();
        let Command::Check(check) = cli.command else {
            panic!("parsed another command");
        };
        check.run()
    }

    #[test]
    fn checks_and_locks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(check(dir.path()), Err(Failure::Startup(_))));

        let genesis = FakeGenesis::new(1, Upgrades::sonic()).build().unwrap();
        let datadir = DataDir::new(dir.path());
        drop(open_datadir(&datadir, Some(&genesis)).unwrap());
        check(dir.path()).unwrap();

        datadir.write_errlock("earlier failure").unwrap();
        assert!(matches!(check(dir.path()), Err(Failure::Startup(_))));
    }
}
