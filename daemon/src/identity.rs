//! Persistent agent identity.
//!
//! `identity.json` holds the subject identifier (the monitor this host reports
//! under) and the machine identifier, each sealed with AES-256-GCM and base64
//! encoded. A missing or unreadable file triggers first-run setup.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const KEY_ENV: &str = "HOSTWATCH_IDENTITY_KEY";
const DEFAULT_KEY: &[u8; 32] = b"12345678901234567890123456789012";
const NONCE_LEN: usize = 12;
const MACHINE_ID_FILES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity value is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("identity key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("ciphertext too short")]
    Truncated,
    #[error("cipher failure (wrong key or corrupted value)")]
    Cipher,
    #[error("decrypted value is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("subject id must not be empty")]
    EmptySubject,
}

/// Who this agent reports as, plus host facts sent alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub machine_id: String,
    pub hostname: String,
    pub os: String,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            machine_id: machine_id.into(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "machineId")]
    machine_id: String,
}

/// Seals and opens identity values.
pub struct IdentityCipher {
    cipher: Aes256Gcm,
}

impl IdentityCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, IdentityError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| IdentityError::KeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Uses `HOSTWATCH_IDENTITY_KEY` when set, otherwise the built-in key.
    pub fn from_env() -> Result<Self, IdentityError> {
        match std::env::var(KEY_ENV) {
            Ok(key) => Self::from_key(key.as_bytes()),
            Err(_) => Self::from_key(DEFAULT_KEY),
        }
    }

    /// Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plain: &str) -> Result<String, IdentityError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|_| IdentityError::Cipher)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, IdentityError> {
        let data = BASE64.decode(encoded.trim())?;
        if data.len() < NONCE_LEN {
            return Err(IdentityError::Truncated);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| IdentityError::Cipher)?;
        Ok(String::from_utf8(plain)?)
    }
}

/// Reads and decrypts the identity file.
pub fn load(path: &Path, cipher: &IdentityCipher) -> Result<Identity, IdentityError> {
    let content = std::fs::read_to_string(path)?;
    let stored: StoredIdentity = serde_json::from_str(&content)?;
    let subject = cipher.decrypt(&stored.user_id)?;
    let machine = cipher.decrypt(&stored.machine_id)?;
    if subject.trim().is_empty() {
        return Err(IdentityError::EmptySubject);
    }
    Ok(Identity::new(subject, machine))
}

/// Encrypts both identifiers and writes the identity file (0600 on unix).
pub fn save(path: &Path, cipher: &IdentityCipher, identity: &Identity) -> Result<(), IdentityError> {
    let stored = StoredIdentity {
        user_id: cipher.encrypt(&identity.subject_id)?,
        machine_id: cipher.encrypt(&identity.machine_id)?,
    };
    let data = serde_json::to_string_pretty(&stored)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data.as_bytes())?;
    Ok(())
}

/// Loads the stored identity, running first-run setup when needed.
///
/// An explicit `subject_override` replaces whatever subject is stored.
/// Otherwise `prompt` is asked for a subject only when no usable file exists.
pub fn load_or_create(
    path: &Path,
    cipher: &IdentityCipher,
    subject_override: Option<&str>,
    prompt: impl FnOnce() -> std::io::Result<String>,
) -> Result<Identity, IdentityError> {
    let existing = if path.exists() {
        match load(path, cipher) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "stored identity unusable, recreating");
                None
            }
        }
    } else {
        None
    };

    match (subject_override.map(str::trim), existing) {
        (Some(s), Some(identity)) if s == identity.subject_id => Ok(identity),
        (None, Some(identity)) => Ok(identity),
        (Some(s), existing) => create(path, cipher, s, existing.map(|i| i.machine_id)),
        (None, None) => {
            let answer = prompt()?;
            create(path, cipher, answer.trim(), None)
        }
    }
}

fn create(
    path: &Path,
    cipher: &IdentityCipher,
    subject: &str,
    machine: Option<String>,
) -> Result<Identity, IdentityError> {
    if subject.is_empty() {
        return Err(IdentityError::EmptySubject);
    }
    let identity = Identity::new(subject, machine.unwrap_or_else(machine_id));
    save(path, cipher, &identity)?;
    tracing::info!(path = %path.display(), "identity stored (encrypted)");
    Ok(identity)
}

/// Stable host identifier: the OS machine id when readable, else a fresh UUID.
pub fn machine_id() -> String {
    MACHINE_ID_FILES
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Interactive stdin prompt used on first run.
pub fn prompt_subject_id() -> std::io::Result<String> {
    print!("Enter your User ID (or Device Key): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line)
}
