//! fleetprov - claim-based fleet provisioning client.
//!
//! Usage:
//!   fleetprov provision --config config/fleetprov.toml
//!   fleetprov validate --config config/fleetprov.toml
//!   fleetprov show --config config/fleetprov.toml

use anyhow::Result;
use clap::Parser;
use fleetprov::cli::commands::{run_provision, run_show, run_validate};
use fleetprov::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Provision(args) => run_provision(args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Show(args) => run_show(args),
    }
}
