//! Durable credential storage.
//!
//! The gateway password is the only state that outlives the process: read
//! at startup, written on a successful login, and deliberately kept when a
//! handshake is rejected so reconnect attempts can reuse it.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

/// Credential storage error.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// File-backed store for the single gateway credential.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store under the platform config directory (`<config>/clawlink`).
    ///
    /// # Errors
    /// Fails when the platform reports no config directory.
    pub fn open_default() -> Result<Self, CredentialError> {
        let dir = dirs::config_dir().ok_or(CredentialError::NoConfigDir)?;
        Ok(Self::at(dir.join("clawlink").join("credential")))
    }

    /// Store backed by an explicit file path.
    #[must_use]
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the stored credential. A missing file is simply `None`.
    ///
    /// # Errors
    /// Fails on read errors other than the file not existing.
    pub fn load(&self) -> Result<Option<String>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the credential, creating the parent directory if needed.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn store(&self, credential: &str) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, credential)?;
        Ok(())
    }

    /// Remove the stored credential.
    ///
    /// # Errors
    /// Fails on I/O errors other than the file already being gone.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
