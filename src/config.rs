//! Process-wide settings backed by a YAML file.
//!
//! The file is a two-level map of sections to keys:
//!
//! ```yaml
//! API:
//!   token: "..."
//! Bot:
//!   prefix: "!"
//! ```
//!
//! [`ConfigStore::open`] hands the connection credential (`API.token`) back
//! to the caller exactly once. After that, deny-listed entries can be neither
//! read nor written through the store, whoever asks. Every successful
//! [`ConfigStore::set`] rewrites the whole file under a single write lock.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_lock::{Mutex, RwLock};
use secrecy::SecretString;
use serde_yaml::Value;
use tracing::{debug, warn};

pub type Section = BTreeMap<String, Value>;
pub type Settings = BTreeMap<String, Section>;

/// Sections that are never readable or writable at runtime.
const DENIED_SECTIONS: &[&str] = &["API"];
/// Keys that are never readable or writable at runtime, in any section.
const DENIED_KEYS: &[&str] = &["token"];

fn is_denied(section: &str, key: &str) -> bool {
    DENIED_SECTIONS.contains(&section) || DENIED_KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    AccessDenied { section: String, key: String },
    NotFound { section: String, key: String },
    /// The value exists but has the wrong shape.
    Invalid { section: String, key: String },
    MissingToken,
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::AccessDenied { section, key } => {
                write!(f, "`{}.{}` can't be accessed while the bot is running", section, key)
            }
            ConfigError::NotFound { section, key } => {
                write!(f, "no setting named `{}.{}`", section, key)
            }
            ConfigError::Invalid { section, key } => {
                write!(f, "setting `{}.{}` has an unexpected type", section, key)
            }
            ConfigError::MissingToken => write!(f, "settings file has no `API.token`"),
            ConfigError::Io(e) => write!(f, "settings file I/O error: {}", e),
            ConfigError::Yaml(e) => write!(f, "settings file is not valid YAML: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Yaml(e)
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

pub struct ConfigStore {
    path: PathBuf,
    settings: RwLock<Settings>,
    /// Serialises `set` so concurrent writers never interleave file writes.
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the settings file and take the connection credential out of it.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, SecretString), ConfigError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_yaml::from_str(&raw)?;

        let token = settings
            .get("API")
            .and_then(|api| api.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::new(t.to_string()))
            .ok_or(ConfigError::MissingToken)?;

        debug!(path = %path.display(), sections = settings.len(), "loaded settings");

        Ok((
            Self {
                path,
                settings: RwLock::new(settings),
                write_lock: Mutex::new(()),
            },
            token,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a setting.
    pub async fn get(&self, section: &str, key: &str) -> Result<Value, ConfigError> {
        if is_denied(section, key) {
            warn!(section, key, "refused read of deny-listed setting");
            return Err(denied(section, key));
        }
        self.settings
            .read()
            .await
            .get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .ok_or_else(|| ConfigError::NotFound {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Like [`get`](Self::get), but an absent setting yields `default`.
    pub async fn get_or(
        &self,
        section: &str,
        key: &str,
        default: impl Into<Value>,
    ) -> Result<Value, ConfigError> {
        match self.get(section, key).await {
            Err(ConfigError::NotFound { .. }) => Ok(default.into()),
            other => other,
        }
    }

    /// Read a setting as text. Numbers and booleans are rendered.
    pub async fn get_str(&self, section: &str, key: &str) -> Result<String, ConfigError> {
        match self.get(section, key).await? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(ConfigError::Invalid {
                section: section.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Read a setting as an unsigned integer. Numeric strings are accepted.
    pub async fn get_u64(&self, section: &str, key: &str) -> Result<u64, ConfigError> {
        let value = self.get(section, key).await?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| ConfigError::Invalid {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Change a setting and persist the whole file.
    ///
    /// If the write fails the in-memory value stays changed and the I/O error
    /// is returned.
    pub async fn set(
        &self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), ConfigError> {
        if is_denied(section, key) {
            warn!(section, key, "refused write of deny-listed setting");
            return Err(denied(section, key));
        }

        let _write = self.write_lock.lock().await;
        let serialized = {
            let mut settings = self.settings.write().await;
            settings
                .entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.into());
            serde_yaml::to_string(&*settings)?
        };
        tokio::fs::write(&self.path, serialized).await?;
        debug!(section, key, "setting updated");
        Ok(())
    }
}

fn denied(section: &str, key: &str) -> ConfigError {
    ConfigError::AccessDenied {
        section: section.to_string(),
        key: key.to_string(),
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
