use anyhow::{bail, Context, Result};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

/// Mutual-TLS material for the claim connection.
#[derive(Debug, Clone, Copy)]
pub struct ClaimTlsPaths<'a> {
    pub certificate: &'a Path,
    pub private_key: &'a Path,
    pub root_ca: &'a Path,
}

/// Build a client config that authenticates with the claim credential and
/// verifies the broker against `root_ca`.
pub fn build_client_config(paths: ClaimTlsPaths<'_>, alpn: &[String]) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let ca_certs = load_certificates(paths.root_ca)?;
    let (added, _) = roots.add_parsable_certificates(&ca_certs);
    if added == 0 {
        bail!("no CA certificates loaded from {}", paths.root_ca.display());
    }

    let chain = load_certificates(paths.certificate)?;
    let key = load_private_key(paths.private_key)?;

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .context("build TLS client config")?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let reader = &mut BufReader::new(
        File::open(path).with_context(|| format!("open certificate {}", path.display()))?,
    );
    let der = certs(reader).with_context(|| format!("parse certificates {}", path.display()))?;
    if der.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(der.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let bytes = std::fs::read(path).with_context(|| format!("read key {}", path.display()))?;
    let mut cursor = Cursor::new(&bytes);

    let parsers: [fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>; 3] =
        [pkcs8_private_keys, rsa_private_keys, ec_private_keys];
    for parse in parsers {
        cursor.set_position(0);
        if let Some(key) = parse(&mut cursor)
            .with_context(|| format!("parse private key {}", path.display()))?
            .into_iter()
            .next()
        {
            return Ok(PrivateKey(key));
        }
    }
    bail!("no supported private key found in {}", path.display());
}
