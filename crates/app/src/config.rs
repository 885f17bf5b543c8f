//! TOML configuration
//!
//! Looked up in the platform config dir (`raidroom.toml`) unless a path is
//! given explicitly. A missing file means defaults everywhere.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use raidroom_core::{Identity, UserId};
use raidroom_net::{ServerConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::SessionOptions;

const CONFIG_FILE: &str = "raidroom.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub session: SessionSection,
    pub identity: IdentitySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: IpAddr,
    pub port: u16,
    /// SQLite file; defaults to the platform data dir
    pub database: Option<PathBuf>,
    pub liveness_timeout_secs: u64,
    pub max_peers_per_room: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            database: None,
            liveness_timeout_secs: 30,
            max_peers_per_room: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub cursor_interval_ms: u64,
    pub backfill_limit: u32,
    pub rollback_failed_writes: bool,
    pub reconnect_delays_ms: Vec<u64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            cursor_interval_ms: options.cursor_interval.as_millis() as u64,
            backfill_limit: options.backfill_limit,
            rollback_failed_writes: options.rollback_failed_writes,
            reconnect_delays_ms: options.reconnect_delays_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub user_id: Option<UserId>,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub avatar: Option<String>,
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "raidroom", "raidroom").map(|d| d.config_dir().join(CONFIG_FILE))
    }

    /// Default database location
    pub fn default_database_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "raidroom", "raidroom").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine data directory",
            ))
        })?;

        Ok(dirs.data_dir().join("raidroom.db"))
    }

    /// Load from an explicit path, or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => {
                    debug!("No config directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.server.bind,
            port: self.server.port,
            liveness_timeout: Duration::from_secs(self.server.liveness_timeout_secs),
            max_peers_per_room: self.server.max_peers_per_room,
            ..ServerConfig::default()
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.server.database {
            Some(p) => Ok(p.clone()),
            None => Self::default_database_path(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        let defaults = SessionOptions::default();
        SessionOptions {
            cursor_interval: Duration::from_millis(self.session.cursor_interval_ms),
            backfill_limit: self.session.backfill_limit,
            rollback_failed_writes: self.session.rollback_failed_writes,
            reconnect_delays_ms: if self.session.reconnect_delays_ms.is_empty() {
                defaults.reconnect_delays_ms
            } else {
                self.session.reconnect_delays_ms.clone()
            },
        }
    }

    /// Identity from the `[identity]` section; `None` without a display name
    pub fn identity(&self) -> Option<Identity> {
        let name = self.identity.display_name.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }

        let mut identity = Identity::new(self.identity.user_id.unwrap_or_default(), name);
        if let Some(color) = &self.identity.color {
            identity = identity.with_color(color.clone());
        }
        if let Some(avatar) = &self.identity.avatar {
            identity = identity.with_avatar(avatar.clone());
        }
        Some(identity)
    }
}
