//! Configuration system for Tessera.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TESSERA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tessera/config.toml
//!   3. ~/.config/tessera/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub collector: CollectorConfig,
    pub routes: RoutesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// PKCS#8 PEM private key. Generated on first daemon start; the public
    /// key is written next to it with a `.pub` suffix.
    pub identity_path: PathBuf,
    /// RSA modulus size for generated identities.
    pub key_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: SocketAddr,
    /// Host placed in this node's `tcp_transport` route. Empty = listen IP.
    pub advertise_host: String,
    /// Accept unencrypted `"plain"` packets. Loopback testing only.
    pub allow_plain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long a caller waits for a response.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Requests held while a session is not yet authenticated.
    pub max_pending_requests: usize,
    /// Queued requests older than this are answered with NotAuthorized.
    pub pending_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the on-disk capsule cache.
    pub cache_path: PathBuf,
    /// If false, capsules live only in memory.
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Breadth-first levels before RecursionLimitExceeded.
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Learned routes older than this are pruned.
    pub route_ttl_secs: u64,
    /// JSON file holding learned routes across restarts.
    pub table_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 8760;

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_path: config_dir().join("identity.pem"),
            key_bits: crate::crypto::DEFAULT_KEY_BITS,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            advertise_host: String::new(),
            allow_plain: false,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 64,
            pending_ttl_secs: 30,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_path: data_dir().join("capsules"),
            persist: true,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { max_depth: 64 }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            route_ttl_secs: 3600,
            table_path: data_dir().join("routes.json"),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tessera")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tessera")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TesseraConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read `path` if it exists, defaults otherwise. No env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TESSERA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&Self::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply TESSERA_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TESSERA_NETWORK__LISTEN_ADDR") {
            if let Ok(addr) = v.parse() {
                self.network.listen_addr = addr;
            }
        }
        if let Some(v) = lookup("TESSERA_RPC__TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.rpc.timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("TESSERA_NETWORK__ALLOW_PLAIN") {
            self.network.allow_plain = v == "true" || v == "1";
        }
        if let Some(v) = lookup("TESSERA_STORE__PERSIST") {
            self.store.persist = v == "true" || v == "1";
        }
    }
}
