//! The `sonic` command line.
//!
//! Exit codes: `0` after a normal shutdown, `1` on startup or configuration
//! errors, `2` when the node stopped on a permanent error and recorded it in
//! the data directory's `errlock`.

mod cmd;

use std::process::ExitCode;

use clap::Parser;
use sonic_node::Fatal;
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter in `RUST_LOG` syntax, e.g. `info,sonic_dag=debug`. Takes
    /// precedence over `RUST_LOG`.
    #[arg(long = "log.filter", value_name = "FILTER", global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: cmd::Command,
}

/// Why a command failed, which decides the exit code.
#[derive(Debug)]
pub(crate) enum Failure {
    Startup(eyre::Report),
    Fatal(Fatal),
}

impl Failure {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::Startup(_) => 1,
            Self::Fatal(_) => 2,
        }
    }
}

impl From<eyre::Report> for Failure {
    fn from(report: eyre::Report) -> Self {
        Self::Startup(report)
    }
}

impl From<Fatal> for Failure {
    fn from(fatal: Fatal) -> Self {
        // A locked data directory was poisoned by an earlier run, not this one.
        if fatal.writes_errlock() {
            Self::Fatal(fatal)
        } else {
            Self::Startup(eyre::Report::new(fatal))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref());

    match cli.command.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            match &failure {
                Failure::Startup(report) => error!(error = ?report, "failed"),
                Failure::Fatal(fatal) => {
                    error!(error = %fatal.report(), "stopped on a permanent error")
                }
            }
            ExitCode::from(failure.exit_code())
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;
    use sonic_kvdb::ErrlockError;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn locked_datadir_is_a_startup_error() {
        let locked = Fatal::Locked(ErrlockError {
            path: "errlock".into(),
            message: "boom".to_string(),
        });
        assert_eq!(Failure::from(locked).exit_code(), 1);
        assert_eq!(Failure::from(Fatal::structural("root mismatch")).exit_code(), 2);
        assert_eq!(Failure::from(eyre::eyre!("bad flag")).exit_code(), 1);
    }

    #[test]
    fn log_filter_is_global() {
        let cli = Cli::try_parse_from(["sonic", "check", "--datadir", "/tmp/x", "--log.filter", "debug"])
            .unwrap();
        assert_eq!(cli.log_filter.as_deref(), Some("debug"));
    }
}
