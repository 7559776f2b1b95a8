//! Account and domain key persistence
//!
//! ```text
//! account_key_path             # serialized CA account credentials (0600)
//! domain_key_dir/
//! └── example.com.key.pem      # PKCS#8 domain key pair (0600)
//! ```
//!
//! Both kinds of key are generated once and reused for every later order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::KeyPair;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::AcmeError;

/// Owner of the persisted key material
#[derive(Debug)]
pub struct KeyStore {
    account_key_path: PathBuf,
    domain_key_dir: PathBuf,
    /// Serializes load-or-generate so two flows never race to create a key
    generate_lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(account_key_path: impl Into<PathBuf>, domain_key_dir: impl Into<PathBuf>) -> Self {
        Self {
            account_key_path: account_key_path.into(),
            domain_key_dir: domain_key_dir.into(),
            generate_lock: Mutex::new(()),
        }
    }

    pub fn account_key_path(&self) -> &Path {
        &self.account_key_path
    }

    pub fn domain_key_path(&self, domain: &str) -> PathBuf {
        self.domain_key_dir
            .join(format!("{}.key.pem", domain.to_ascii_lowercase()))
    }

    /// Previously saved account credentials, if any
    pub async fn load_account_credentials(&self) -> Result<Option<String>, AcmeError> {
        let path = self.account_key_path.clone();
        blocking(move || match fs::read_to_string(&path) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AcmeError::KeyMaterial(format!(
                "cannot read account credentials at {}: {}",
                path.display(),
                e
            ))),
        })
        .await
    }

    /// Persist account credentials, readable by the owner only
    pub async fn save_account_credentials(&self, json: String) -> Result<(), AcmeError> {
        let path = self.account_key_path.clone();
        blocking(move || {
            write_owner_only(&path, json.as_bytes()).map_err(|e| {
                AcmeError::KeyMaterial(format!(
                    "cannot write account credentials to {}: {}",
                    path.display(),
                    e
                ))
            })
        })
        .await?;
        info!(path = %self.account_key_path.display(), "Saved CA account credentials");
        Ok(())
    }

    /// Load the domain's key pair, generating and persisting it on first use
    pub async fn domain_key(&self, domain: &str) -> Result<KeyPair, AcmeError> {
        let _guard = self.generate_lock.lock().await;
        let path = self.domain_key_path(domain);
        let domain = domain.to_string();

        blocking(move || {
            match fs::read_to_string(&path) {
                Ok(pem) => {
                    debug!(domain = %domain, "Loaded domain key pair");
                    return KeyPair::from_pem(&pem).map_err(|e| {
                        AcmeError::KeyMaterial(format!(
                            "stored key for {} is unusable: {}",
                            domain, e
                        ))
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AcmeError::KeyMaterial(format!(
                        "cannot read key for {}: {}",
                        domain, e
                    )))
                }
            }

            let key = KeyPair::generate().map_err(|e| {
                AcmeError::KeyMaterial(format!("cannot generate key for {}: {}", domain, e))
            })?;
            write_owner_only(&path, key.serialize_pem().as_bytes()).map_err(|e| {
                AcmeError::KeyMaterial(format!("cannot persist key for {}: {}", domain, e))
            })?;
            info!(domain = %domain, path = %path.display(), "Generated domain key pair");
            Ok(key)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AcmeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AcmeError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AcmeError::KeyMaterial(format!("key store task failed: {}", e)))?
}

/// Atomically write `contents` to `path` with 0600 permissions
///
/// Missing parent directories are created with 0700.
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.exists() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }

    let mut staged = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}
