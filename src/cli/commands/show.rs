use crate::cli::args::ConfigArgs;
use crate::config::Config;
use crate::keystore::load_identity;
use anyhow::{Context, Result};

pub fn run_show(args: ConfigArgs) -> Result<()> {
    let config = Config::load_with_overrides(&args.config)?;
    let record = load_identity(&config.credentials.dir).with_context(|| {
        format!(
            "no identity recorded in {}",
            config.credentials.dir.display()
        )
    })?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
