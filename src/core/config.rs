use crate::provisioning::topics::validate_template_name;
use crate::provisioning::{
    FieldLimits, PayloadFormat, ProvisioningPlan, RetryPolicy, StepSettings, StrayPublishPolicy,
    WaitBudget,
};
use crate::transport::ConnectRequest;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a provisioning run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub claim: ClaimConfig,
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub endpoint: String,
    #[serde(default = "BrokerConfig::default_port")]
    pub port: u16,
    /// Also used as the CSR subject; typically the device serial.
    pub client_id: String,
    #[serde(default = "BrokerConfig::default_keep_alive")]
    pub keep_alive_secs: u64,
    /// ALPN protocols offered during the TLS handshake (e.g. `x-amzn-mqtt-ca` on 443).
    #[serde(default)]
    pub alpn: Vec<String>,
}

impl BrokerConfig {
    const fn default_port() -> u16 {
        8883
    }

    const fn default_keep_alive() -> u64 {
        60
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimConfig {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub root_ca_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    pub template_name: String,
    #[serde(default)]
    pub format: PayloadFormat,
    /// Template parameters sent with RegisterThing.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "CredentialsConfig::default_dir")]
    pub dir: PathBuf,
    #[serde(default = "CredentialsConfig::default_label")]
    pub key_label: String,
    #[serde(default = "CredentialsConfig::default_label")]
    pub certificate_label: String,
}

impl CredentialsConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("credentials")
    }

    fn default_label() -> String {
        "device".to_string()
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            key_label: Self::default_label(),
            certificate_label: Self::default_label(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "TimingConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "TimingConfig::default_max_polls")]
    pub max_polls: u32,
    /// TCP connect plus TLS handshake, in whole seconds.
    #[serde(default = "TimingConfig::default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,
    #[serde(default = "TimingConfig::default_connack_timeout_ms")]
    pub connack_timeout_ms: u64,
    #[serde(default)]
    pub stray_publish: StrayPublishPolicy,
}

impl TimingConfig {
    const fn default_poll_timeout_ms() -> u64 {
        700
    }

    const fn default_max_polls() -> u32 {
        30
    }

    const fn default_transport_timeout_secs() -> u64 {
        5
    }

    const fn default_connack_timeout_ms() -> u64 {
        1_000
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            max_polls: Self::default_max_polls(),
            transport_timeout_secs: Self::default_transport_timeout_secs(),
            connack_timeout_ms: Self::default_connack_timeout_ms(),
            stray_publish: StrayPublishPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// MQTT packet limit and response copy buffer.
    #[serde(default = "LimitsConfig::default_network_buffer")]
    pub network_buffer_bytes: usize,
    #[serde(default = "LimitsConfig::default_certificate_pem")]
    pub certificate_pem_bytes: usize,
    #[serde(default = "LimitsConfig::default_certificate_id")]
    pub certificate_id_bytes: usize,
    #[serde(default = "LimitsConfig::default_ownership_token")]
    pub ownership_token_bytes: usize,
    #[serde(default = "LimitsConfig::default_thing_name")]
    pub thing_name_bytes: usize,
}

impl LimitsConfig {
    const fn default_network_buffer() -> usize {
        2048
    }

    const fn default_certificate_pem() -> usize {
        2048
    }

    const fn default_certificate_id() -> usize {
        64
    }

    const fn default_ownership_token() -> usize {
        512
    }

    const fn default_thing_name() -> usize {
        128
    }

    pub fn field_limits(&self) -> FieldLimits {
        FieldLimits {
            certificate_pem: self.certificate_pem_bytes,
            certificate_id: self.certificate_id_bytes,
            ownership_token: self.ownership_token_bytes,
            thing_name: self.thing_name_bytes,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            network_buffer_bytes: Self::default_network_buffer(),
            certificate_pem_bytes: Self::default_certificate_pem(),
            certificate_id_bytes: Self::default_certificate_id(),
            ownership_token_bytes: Self::default_ownership_token(),
            thing_name_bytes: Self::default_thing_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: crate::ops::LogFormat,
}

impl Config {
    /// Load configuration from FLEETPROV_CONFIG (default `config/fleetprov.toml`)
    /// and apply environment overrides.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Load `path` and apply environment overrides.
    pub fn load_with_overrides(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::load(path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("FLEETPROV_ENDPOINT") {
            self.broker.endpoint = endpoint;
        }
        if let Ok(template) = std::env::var("FLEETPROV_TEMPLATE") {
            self.provisioning.template_name = template;
        }
        if let Ok(client_id) = std::env::var("FLEETPROV_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
    }

    /// Check values and claim material before any network activity.
    pub fn validate(&self) -> Result<()> {
        if self.broker.endpoint.trim().is_empty() {
            bail!("broker.endpoint is empty");
        }
        if self.broker.client_id.is_empty() {
            bail!("broker.client_id is empty");
        }
        if self.broker.client_id.chars().any(char::is_whitespace) {
            bail!("broker.client_id contains whitespace");
        }
        if self.broker.client_id.len() > self.limits.thing_name_bytes {
            bail!(
                "broker.client_id exceeds {} bytes",
                self.limits.thing_name_bytes
            );
        }
        if self.broker.keep_alive_secs == 0 {
            bail!("broker.keep_alive_secs must be positive");
        }
        if self.timing.transport_timeout_secs == 0 {
            bail!("timing.transport_timeout_secs must be positive");
        }
        validate_template_name(&self.provisioning.template_name)
            .map_err(|e| anyhow::anyhow!("provisioning.template_name: {e}"))?;
        for (label, path) in [
            ("claim.certificate_path", &self.claim.certificate_path),
            ("claim.private_key_path", &self.claim.private_key_path),
            ("claim.root_ca_path", &self.claim.root_ca_path),
        ] {
            if !path.exists() {
                bail!("{label} {} missing", path.display());
            }
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.timing.max_polls == 0 || self.timing.poll_timeout_ms == 0 {
            bail!("timing.max_polls and timing.poll_timeout_ms must be positive");
        }
        if self.limits.network_buffer_bytes < self.limits.certificate_pem_bytes {
            bail!("limits.network_buffer_bytes is smaller than limits.certificate_pem_bytes");
        }
        Ok(())
    }

    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            client_id: self.broker.client_id.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            transport_timeout: Duration::from_secs(self.timing.transport_timeout_secs),
            connack_timeout: Duration::from_millis(self.timing.connack_timeout_ms),
            max_packet_bytes: self.limits.network_buffer_bytes,
        }
    }

    pub fn provisioning_plan(&self) -> ProvisioningPlan {
        ProvisioningPlan {
            connect: self.connect_request(),
            template: self.provisioning.template_name.clone(),
            format: self.provisioning.format,
            parameters: self.provisioning.parameters.clone(),
            key_label: self.credentials.key_label.clone(),
            certificate_label: self.credentials.certificate_label.clone(),
            payload_capacity: self.limits.network_buffer_bytes,
            step: StepSettings {
                budget: WaitBudget::new(
                    Duration::from_millis(self.timing.poll_timeout_ms),
                    self.timing.max_polls,
                ),
                stray_policy: self.timing.stray_publish,
            },
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEETPROV_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/fleetprov.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
