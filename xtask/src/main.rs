//! Developer tasks for sonic.

use clap::Parser;

use crate::generate_genesis::GenerateGenesis;

mod generate_genesis;

#[derive(Parser, Debug)]
#[command(author)]
#[command(version)]
#[command(about)]
#[command(long_about = None)]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Generates validator keys and a signed JSON genesis, plus a node
    /// configuration per validator.
    GenerateGenesis(GenerateGenesis),
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    match args.action {
        Action::GenerateGenesis(args) => args.run(),
    }
}
