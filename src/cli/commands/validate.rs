use crate::cli::args::ConfigArgs;
use crate::config::Config;
use crate::net::tls::{build_client_config, ClaimTlsPaths};
use anyhow::{Context, Result};

/// Parse the config, check values and make sure the claim material loads.
pub fn run_validate(args: ConfigArgs) -> Result<()> {
    let config = Config::load_with_overrides(&args.config)?;
    config.validate()?;
    build_client_config(
        ClaimTlsPaths {
            certificate: &config.claim.certificate_path,
            private_key: &config.claim.private_key_path,
            root_ca: &config.claim.root_ca_path,
        },
        &config.broker.alpn,
    )
    .context("claim TLS material")?;
    println!("{}: ok", args.config.display());
    Ok(())
}
