//! fleetprov CLI.
//!
//! - `fleetprov provision` - Run the claim-to-identity flow
//! - `fleetprov validate` - Check configuration and claim material
//! - `fleetprov show` - Print the stored identity record

mod args;
pub mod commands;

pub use args::{Cli, Commands, ConfigArgs, ProvisionArgs};
