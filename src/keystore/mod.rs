//! Key management and credential storage.
//!
//! - `file` - filesystem-backed store using rcgen for key and CSR generation

pub mod file;

pub use file::{load_identity, FileKeyStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("unknown key handle {0}")]
    UnknownKey(String),
    #[error("certificate for {label} is not a valid PEM certificate")]
    InvalidCertificate { label: String },
    #[error("invalid label {0:?}")]
    InvalidLabel(String),
    #[error("credential store io failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("identity record is malformed: {0}")]
    Record(#[from] serde_json::Error),
}

impl From<rcgen::Error> for KeyStoreError {
    fn from(err: rcgen::Error) -> Self {
        Self::Generation(err.to_string())
    }
}

/// Opaque reference to a private key held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle(String);

impl KeyHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Freshly generated key plus the CSR that proves possession of it.
#[derive(Debug, Clone)]
pub struct CsrArtifact {
    pub csr_pem: String,
    pub key_handle: KeyHandle,
}

/// Persisted summary of a completed provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub thing_name: String,
    pub certificate_id: String,
    pub template: String,
    pub key_label: String,
    pub certificate_label: String,
    pub provisioned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_configuration: BTreeMap<String, String>,
}

pub trait KeyStore: Send + Sync {
    /// Create a new key pair under `label` and a CSR whose subject CN is `common_name`.
    fn generate_key_and_csr(
        &self,
        label: &str,
        common_name: &str,
    ) -> Result<CsrArtifact, KeyStoreError>;

    /// Persist the issued certificate next to the key it certifies.
    fn store_certificate(
        &self,
        handle: &KeyHandle,
        label: &str,
        certificate_pem: &str,
    ) -> Result<(), KeyStoreError>;

    fn store_identity(&self, record: &IdentityRecord) -> Result<(), KeyStoreError>;
}
