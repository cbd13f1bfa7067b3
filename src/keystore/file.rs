use super::{CsrArtifact, IdentityRecord, KeyHandle, KeyStore, KeyStoreError};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const IDENTITY_FILE: &str = "identity.json";

/// Stores keys, certificates and the identity record as files in one directory.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.key.pem"))
    }

    pub fn certificate_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.crt.pem"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn ensure_dir(&self) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))
    }
}

impl KeyStore for FileKeyStore {
    fn generate_key_and_csr(
        &self,
        label: &str,
        common_name: &str,
    ) -> Result<CsrArtifact, KeyStoreError> {
        validate_label(label)?;
        self.ensure_dir()?;

        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, common_name.to_string());
        params.distinguished_name = subject;
        let csr_pem = params.serialize_request(&key_pair)?.pem()?;

        let path = self.key_path(label);
        write_private(&path, key_pair.serialize_pem().as_bytes())?;
        info!("generated key {} at {}", label, path.display());

        Ok(CsrArtifact {
            csr_pem,
            key_handle: KeyHandle::new(label),
        })
    }

    fn store_certificate(
        &self,
        handle: &KeyHandle,
        label: &str,
        certificate_pem: &str,
    ) -> Result<(), KeyStoreError> {
        validate_label(label)?;
        if !self.key_path(handle.label()).exists() {
            return Err(KeyStoreError::UnknownKey(handle.to_string()));
        }
        let mut reader = BufReader::new(certificate_pem.as_bytes());
        let parsed = rustls_pemfile::certs(&mut reader).map_err(|_| {
            KeyStoreError::InvalidCertificate {
                label: label.to_string(),
            }
        })?;
        if parsed.is_empty() {
            return Err(KeyStoreError::InvalidCertificate {
                label: label.to_string(),
            });
        }
        let path = self.certificate_path(label);
        fs::write(&path, certificate_pem).map_err(|source| io_error(&path, source))?;
        info!("stored certificate {} for key {}", label, handle);
        Ok(())
    }

    fn store_identity(&self, record: &IdentityRecord) -> Result<(), KeyStoreError> {
        self.ensure_dir()?;
        let path = self.identity_path();
        let body = serde_json::to_vec_pretty(record)?;
        fs::write(&path, body).map_err(|source| io_error(&path, source))?;
        info!("recorded identity {} at {}", record.thing_name, path.display());
        Ok(())
    }
}

/// Read back the record written by a previous successful run.
pub fn load_identity(dir: &Path) -> Result<IdentityRecord, KeyStoreError> {
    let path = dir.join(IDENTITY_FILE);
    let data = fs::read(&path).map_err(|source| io_error(&path, source))?;
    Ok(serde_json::from_slice(&data)?)
}

fn validate_label(label: &str) -> Result<(), KeyStoreError> {
    let ok = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !label.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidLabel(label.to_string()))
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), KeyStoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|source| io_error(path, source))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> KeyStoreError {
    KeyStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
