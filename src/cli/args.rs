//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// fleetprov - obtain a unique device identity using a shared claim certificate.
#[derive(Parser)]
#[command(name = "fleetprov")]
#[command(version)]
#[command(about = "Claim-based fleet provisioning client over MQTT")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Exchange the claim credential for a device certificate and register the thing
    Provision(ProvisionArgs),

    /// Load and validate configuration and claim material without connecting
    Validate(ConfigArgs),

    /// Print the identity recorded by a previous provisioning run
    Show(ConfigArgs),
}

// -----------------------------------------------------------------------------
// Shared arguments
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "FLEETPROV_CONFIG", default_value = "config/fleetprov.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Provision command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Override the configured log level (e.g. debug, fleetprov=trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and print the provisioning plan, then exit
    #[arg(long)]
    pub dry_run: bool,
}
