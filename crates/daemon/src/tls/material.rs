//! Certificate and key material handling
//!
//! Validation happens entirely in memory. Material that passes is written to
//! a [`StagedMaterial`] pair of owner-only files for the configuration
//! builder, which are zeroed and deleted as soon as the swap finishes.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tempfile::{NamedTempFile, TempDir};
use tracing::{trace, warn};
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::{GeneralName, X509Certificate};
use x509_parser::time::ASN1Time;

use super::error::TlsConfigError;

const ZERO_CHUNK: [u8; 4096] = [0u8; 4096];

/// Facts about validated material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialSummary {
    /// DNS names from the leaf's subject alternative names, lowercased
    pub names: Vec<String>,
    pub not_after: DateTime<Utc>,
    /// Certificates in the chain, leaf included
    pub chain_len: usize,
}

/// Check that a PEM certificate chain and private key are well formed and
/// belong together
pub fn validate_material(
    certificate_pem: &str,
    private_key_pem: &str,
    provider: &CryptoProvider,
) -> Result<MaterialSummary, TlsConfigError> {
    let blocks = pem::parse_many(certificate_pem)
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("malformed certificate PEM: {}", e)))?;
    let certs: Vec<_> = blocks.iter().filter(|b| b.tag() == "CERTIFICATE").collect();
    let Some(leaf) = certs.first() else {
        return Err(TlsConfigError::InvalidMaterial(
            "no certificate found in PEM input".to_string(),
        ));
    };

    for (index, block) in certs.iter().enumerate() {
        parse_x509_certificate(block.contents()).map_err(|e| {
            TlsConfigError::InvalidMaterial(format!("certificate {} is not valid X.509: {}", index, e))
        })?;
    }

    let (_, leaf_cert) = parse_x509_certificate(leaf.contents())
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("leaf is not valid X.509: {}", e)))?;
    let names = dns_names(&leaf_cert);
    let not_after = asn1_to_utc(leaf_cert.validity().not_after)?;

    let chain: Vec<CertificateDer<'static>> = certs
        .iter()
        .map(|b| CertificateDer::from(b.contents().to_vec()))
        .collect();
    let key = parse_private_key(private_key_pem)?;

    // Fails unless the key's public half matches the leaf
    CertifiedKey::from_der(chain, key, provider).map_err(|e| {
        TlsConfigError::InvalidMaterial(format!("private key does not match certificate: {}", e))
    })?;

    Ok(MaterialSummary {
        names,
        not_after,
        chain_len: certs.len(),
    })
}

/// `notAfter` of the first certificate in a PEM chain
pub fn leaf_not_after(certificate_pem: &str) -> Result<DateTime<Utc>, TlsConfigError> {
    let block = pem::parse(certificate_pem)
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("malformed certificate PEM: {}", e)))?;
    let (_, cert) = parse_x509_certificate(block.contents())
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("leaf is not valid X.509: {}", e)))?;
    asn1_to_utc(cert.validity().not_after)
}

fn asn1_to_utc(time: ASN1Time) -> Result<DateTime<Utc>, TlsConfigError> {
    DateTime::from_timestamp(time.timestamp(), 0).ok_or_else(|| {
        TlsConfigError::InvalidMaterial(format!("certificate validity {} is out of range", time))
    })
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                let normalized = dns.trim_end_matches('.').to_ascii_lowercase();
                if !normalized.is_empty() && !names.contains(&normalized) {
                    names.push(normalized);
                }
            }
        }
    }
    names
}

fn parse_private_key(private_key_pem: &str) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("malformed private key PEM: {}", e)))?
        .ok_or_else(|| TlsConfigError::InvalidMaterial("no private key found in PEM input".to_string()))
}

/// Build a signing identity from PEM files on disk
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, TlsConfigError> {
    let cert_pem = fs::read(cert_path)
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("cannot read staged certificate: {}", e)))?;
    let key_pem = fs::read(key_path)
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("cannot read staged key: {}", e)))?;

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("staged certificate unreadable: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("staged key unreadable: {}", e)))?
        .ok_or_else(|| TlsConfigError::ListenerSwapFailed("staged key is empty".to_string()))?;

    CertifiedKey::from_der(chain, key, provider)
        .map(Arc::new)
        .map_err(|e| TlsConfigError::ListenerSwapFailed(format!("cannot build signing key: {}", e)))
}

/// Certificate and key written to owner-only transient files
///
/// Both files live in a private directory (0700) and are created 0600.
/// [`StagedMaterial::destroy`] overwrites them with zeros before deleting;
/// dropping without calling it does the same and logs any failure.
#[derive(Debug)]
pub struct StagedMaterial {
    cert: Option<NamedTempFile>,
    key: Option<NamedTempFile>,
    dir: Option<TempDir>,
}

impl StagedMaterial {
    pub fn write(staging_dir: &Path, certificate_pem: &str, private_key_pem: &str) -> std::io::Result<Self> {
        fs::create_dir_all(staging_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("tlsward-staged-")
            .tempdir_in(staging_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        }

        let mut staged = Self {
            cert: None,
            key: None,
            dir: None,
        };
        staged.cert = Some(write_owner_only(dir.path(), "cert", certificate_pem.as_bytes())?);
        staged.key = Some(write_owner_only(dir.path(), "key", private_key_pem.as_bytes())?);
        staged.dir = Some(dir);

        trace!("Staged TLS material");
        Ok(staged)
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.cert.as_ref().map(|f| f.path())
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key.as_ref().map(|f| f.path())
    }

    /// Zero and delete the staged files
    pub fn destroy(mut self) -> std::io::Result<()> {
        self.shred_all()
    }

    fn shred_all(&mut self) -> std::io::Result<()> {
        // Key first; keep going on error so nothing is left behind
        let key = self.key.take().map(shred).unwrap_or(Ok(()));
        let cert = self.cert.take().map(shred).unwrap_or(Ok(()));
        let dir = self.dir.take().map(TempDir::close).unwrap_or(Ok(()));
        key.and(cert).and(dir)
    }
}

impl Drop for StagedMaterial {
    fn drop(&mut self) {
        if let Err(e) = self.shred_all() {
            warn!(error = %e, "Failed to destroy staged TLS material");
        }
    }
}

fn write_owner_only(dir: &Path, prefix: &str, contents: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".pem")
        .tempfile_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Overwrite a file's contents with zeros, flush, then delete it
fn shred(mut file: NamedTempFile) -> std::io::Result<()> {
    let len = file.as_file().metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK.len() as u64) as usize;
        file.write_all(&ZERO_CHUNK[..n])?;
        remaining -= n as u64;
    }
    file.as_file().sync_all()?;
    file.close()
}
