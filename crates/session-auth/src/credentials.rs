//! Credential storage for the session token pair
//!
//! `CredentialStore` owns the current access/refresh pair and its absolute
//! expiry. Reads and writes are synchronous and never suspend: the pair lives
//! behind a `parking_lot::RwLock` and is replaced wholesale, so a reader sees
//! either the old pair or the new one, never a mix.
//!
//! Durability is delegated to a `CredentialPersistence` medium. The in-memory
//! pair is authoritative; persistence runs under the write lock so the medium
//! sees writes in the same order as readers do.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The session's access/refresh pair.
///
/// `expires_at_ms` is a unix timestamp in milliseconds (absolute, not a
/// delta), computed at storage time from the endpoint's `expires_in`.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at_ms: u64,
}

impl CredentialSet {
    /// Whether `now_ms` falls inside the skew margin before expiry.
    pub fn is_near_expiry_at(&self, now_ms: u64, skew: Duration) -> bool {
        now_ms >= self.expires_at_ms.saturating_sub(skew.as_millis() as u64)
    }
}

/// How the stored credentials relate to the refresh skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Usable as-is
    Fresh,
    /// Present but inside the skew window; refresh before use
    NearExpiry,
    /// No credentials; nothing to refresh
    Unauthenticated,
}

/// Medium holding the credential pair between process runs.
pub trait CredentialPersistence: Send + Sync {
    /// Read the stored pair, `None` when nothing is stored.
    fn load(&self) -> Result<Option<CredentialSet>>;

    /// Replace the stored pair.
    fn save(&self, credentials: &CredentialSet) -> Result<()>;

    /// Remove the stored pair.
    fn clear(&self) -> Result<()>;
}

/// No durable medium: credentials live only as long as the store.
#[derive(Debug, Default)]
pub struct MemoryPersistence;

impl CredentialPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<CredentialSet>> {
        Ok(None)
    }

    fn save(&self, _credentials: &CredentialSet) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// On-disk record. Field names are the file format.
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    access: String,
    refresh: String,
    /// Expiration as unix timestamp in milliseconds
    expires: u64,
}

/// JSON file medium.
///
/// A missing file means "no credentials". Writes go through a temp file and
/// rename so a crash never leaves a torn file, and the file is 0600 on unix.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialPersistence for FilePersistence {
    fn load(&self) -> Result<Option<CredentialSet>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "credential file not found, starting unauthenticated");
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
        let stored: StoredCredential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
        info!(path = %self.path.display(), "loaded credentials");
        Ok(Some(CredentialSet {
            access_token: Secret::new(stored.access),
            refresh_token: Secret::new(stored.refresh),
            expires_at_ms: stored.expires,
        }))
    }

    fn save(&self, credentials: &CredentialSet) -> Result<()> {
        let stored = StoredCredential {
            access: credentials.access_token.expose().clone(),
            refresh: credentials.refresh_token.expose().clone(),
            expires: credentials.expires_at_ms,
        };
        write_atomic(&self.path, &stored)
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed credential file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
        }
    }
}

/// Holder of the current session credentials.
pub struct CredentialStore {
    state: RwLock<Option<CredentialSet>>,
    persistence: Arc<dyn CredentialPersistence>,
}

impl CredentialStore {
    /// Build a store seeded from the given medium.
    pub fn load(persistence: Arc<dyn CredentialPersistence>) -> Result<Self> {
        let state = persistence.load()?;
        Ok(Self {
            state: RwLock::new(state),
            persistence,
        })
    }

    /// Store with no durable medium, starting unauthenticated.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(None),
            persistence: Arc::new(MemoryPersistence),
        }
    }

    /// Snapshot of the current pair.
    pub fn get(&self) -> Option<CredentialSet> {
        self.state.read().clone()
    }

    /// Current access token, if authenticated.
    pub fn access_token(&self) -> Option<Secret<String>> {
        self.state
            .read()
            .as_ref()
            .map(|credentials| credentials.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_some()
    }

    /// Replace the pair, computing the absolute expiry from `expires_in_secs`.
    ///
    /// Both tokens must be non-empty; a rejected pair leaves the store
    /// untouched. If the medium fails, the in-memory pair is still replaced
    /// and the error is returned.
    pub fn set(
        &self,
        access_token: String,
        refresh_token: String,
        expires_in_secs: u64,
    ) -> Result<()> {
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(Error::InvalidCredentials(
                "access and refresh tokens must both be present".into(),
            ));
        }
        let credentials = CredentialSet {
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token),
            expires_at_ms: now_millis().saturating_add(expires_in_secs.saturating_mul(1000)),
        };

        let mut state = self.state.write();
        *state = Some(credentials.clone());
        debug!(expires_at_ms = credentials.expires_at_ms, "stored credentials");
        self.persistence.save(&credentials)
    }

    /// Drop both tokens and the expiry.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.take().is_some() {
            debug!("cleared credentials");
        }
        self.persistence.clear()
    }

    /// Classify the stored pair against `skew`.
    pub fn freshness(&self, skew: Duration) -> Freshness {
        match self.state.read().as_ref() {
            None => Freshness::Unauthenticated,
            Some(credentials) if credentials.is_near_expiry_at(now_millis(), skew) => {
                Freshness::NearExpiry
            }
            Some(_) => Freshness::Fresh,
        }
    }

    /// True when credentials exist and expire within `skew`.
    ///
    /// An empty store is unauthenticated rather than near expiry: tokens are
    /// never partially present, so there is no refresh token to use.
    pub fn is_near_expiry(&self, skew: Duration) -> bool {
        self.freshness(skew) == Freshness::NearExpiry
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write the credential file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets 0600 permissions (owner read/write only) since the file
/// contains tokens.
fn write_atomic(path: &Path, data: &StoredCredential) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
