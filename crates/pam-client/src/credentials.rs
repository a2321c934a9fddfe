//! Credential store: the access/refresh token pair plus the cached identity
//! of the logged-in user.
//!
//! The pair is always written and cleared together. `FileCredentialStore`
//! persists to a JSON file so a new process does not force a re-login;
//! `MemoryCredentialStore` keeps everything in-process.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

// ── Types ───────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// On-disk layout of the credential file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAuth {
    credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<Identity>,
}

// ── Store trait ─────────────────────────────────────────────────────

/// Process-wide holder of the token pair and identity. No validation: the
/// store only remembers what it was given.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credentials>;

    fn identity(&self) -> Option<Identity>;

    /// Replace the token pair. `identity: None` keeps the cached identity.
    fn set(&self, credentials: Credentials, identity: Option<Identity>) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

// ── In-memory store ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCredentialStore {
    state: RwLock<Option<StoredAuth>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials, identity: Option<Identity>) -> Self {
        Self {
            state: RwLock::new(Some(StoredAuth {
                credentials,
                identity,
            })),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credentials> {
        read_state(&self.state).map(|s| s.credentials)
    }

    fn identity(&self) -> Option<Identity> {
        read_state(&self.state).and_then(|s| s.identity)
    }

    fn set(&self, credentials: Credentials, identity: Option<Identity>) -> Result<()> {
        replace_state(&self.state, credentials, identity);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

// ── File-backed store ───────────────────────────────────────────────

/// Credential store persisted as `<data_dir>/credentials.json`.
pub struct FileCredentialStore {
    path: PathBuf,
    state: RwLock<Option<StoredAuth>>,
}

impl FileCredentialStore {
    /// Open the store, loading any previously saved credentials. A missing or
    /// unreadable file starts the store empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoredAuth>(&content) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable credential file");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read credential file");
                None
            }
        };
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credentials> {
        read_state(&self.state).map(|s| s.credentials)
    }

    fn identity(&self) -> Option<Identity> {
        read_state(&self.state).and_then(|s| s.identity)
    }

    fn set(&self, credentials: Credentials, identity: Option<Identity>) -> Result<()> {
        let stored = replace_state(&self.state, credentials, identity);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write_json(&self.path, &stored)?;
        debug!(path = %self.path.display(), "credentials persisted");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(path = %self.path.display(), "credentials cleared");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn read_state(state: &RwLock<Option<StoredAuth>>) -> Option<StoredAuth> {
    state.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn replace_state(
    state: &RwLock<Option<StoredAuth>>,
    credentials: Credentials,
    identity: Option<Identity>,
) -> StoredAuth {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    let identity = identity.or_else(|| guard.as_ref().and_then(|s| s.identity.clone()));
    let stored = StoredAuth {
        credentials,
        identity,
    };
    *guard = Some(stored.clone());
    stored
}

/// Atomic JSON write: write to a temp file, restrict it to the owner, then
/// rename over the target.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec(value)?;
    fs::write(&tmp_path, &json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp_path, path)
}
