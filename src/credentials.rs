//! Paired certificate bundle and its on-disk store.
//!
//! One JSON file per bridge, `<dir>/<bridge address>.json`, holding the
//! client certificate, its key and the bridge CA as PEM strings. The bundle
//! is written in one piece so a crash never leaves a half-paired bridge.

use crate::leap::tls;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("credential file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("credentials are incomplete or unparseable: {0}")]
    Invalid(String),
}

/// Client certificate, private key and bridge CA obtained by pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCredentials {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for PairingCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCredentials")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl PairingCredentials {
    /// All three parts present and parseable as PEM.
    pub fn validate(&self) -> Result<(), CredentialError> {
        tls::load_certs(&self.ca).map_err(|e| CredentialError::Invalid(format!("ca: {e}")))?;
        tls::load_certs(&self.cert)
            .map_err(|e| CredentialError::Invalid(format!("cert: {e}")))?;
        tls::load_private_key(&self.key)
            .map_err(|e| CredentialError::Invalid(format!("key: {e}")))?;
        Ok(())
    }
}

/// Credential file for one bridge.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_bridge(dir: &Path, address: &str) -> Self {
        let file: String = address
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self::new(dir.join(format!("{file}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the bridge has never been paired.
    pub fn load(&self) -> Result<Option<PairingCredentials>, CredentialError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No credentials at {:?} (first run)", self.path);
                return Ok(None);
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let credentials: PairingCredentials =
            serde_json::from_slice(&bytes).map_err(|e| CredentialError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        credentials.validate()?;
        info!("Loaded bridge credentials from {:?}", self.path);
        Ok(Some(credentials))
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    pub fn save(&self, credentials: &PairingCredentials) -> Result<(), CredentialError> {
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_vec_pretty(credentials).map_err(|e| CredentialError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let result = (|| {
            let mut file = open_private(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = result {
            if fs::remove_file(&tmp).is_err() {
                warn!("Could not remove temporary credential file {:?}", tmp);
            }
            return Err(io_err(e));
        }

        info!("Saved bridge credentials to {:?}", self.path);
        Ok(())
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    fs::File::create(path)
}
