//! Provision command - runs CreateCertificateFromCsr then RegisterThing.

use crate::cli::args::ProvisionArgs;
use crate::config::Config;
use crate::keystore::FileKeyStore;
use crate::net::tls::{build_client_config, ClaimTlsPaths};
use crate::provisioning::{Backoff, OsEntropy, Provisioner, StandardCodec, TopicSet};
use crate::telemetry;
use crate::time::SystemClock;
use crate::transport::MqttConnector;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub async fn run_provision(args: ProvisionArgs) -> Result<()> {
    let config = Config::load_with_overrides(&args.config.config)?;
    let level = args
        .log_level
        .as_deref()
        .or(config.telemetry.log_level.as_deref());
    telemetry::init_tracing(level, config.telemetry.log_format)?;
    config.validate()?;

    let plan = config.provisioning_plan();
    if args.dry_run {
        let csr = TopicSet::create_certificate_from_csr(plan.format);
        let register = TopicSet::register_thing(&plan.template, plan.format);
        let summary = serde_json::json!({
            "endpoint": format!("{}:{}", config.broker.endpoint, config.broker.port),
            "client_id": plan.connect.client_id,
            "csr_topic": csr.publish,
            "register_topic": register.publish,
            "parameters": plan.parameters,
            "credentials_dir": config.credentials.dir,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let tls = build_client_config(
        ClaimTlsPaths {
            certificate: &config.claim.certificate_path,
            private_key: &config.claim.private_key_path,
            root_ca: &config.claim.root_ca_path,
        },
        &config.broker.alpn,
    )?;
    let connector = MqttConnector::new(&config.broker.endpoint, config.broker.port, Arc::new(tls));
    let keystore = FileKeyStore::new(&config.credentials.dir);
    let codec = StandardCodec::new(config.provisioning.format, config.limits.field_limits());
    let backoff = Backoff::new(config.retry, SystemClock, Arc::new(OsEntropy));

    info!(
        "provisioning {} via template {}",
        plan.connect.client_id, plan.template
    );
    let mut provisioner = Provisioner::new(connector, keystore, Box::new(codec), backoff, plan);
    let identity = provisioner.run().await.context("provisioning failed")?;

    let summary = serde_json::json!({
        "thing_name": identity.thing_name,
        "device_configuration": identity.device_configuration,
        "credentials_dir": config.credentials.dir,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
