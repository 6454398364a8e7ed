use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids;

pub const DEFAULT_PORT: u16 = 21110;
pub const DEFAULT_DATA_DIR: &str = ".plug-my-ai";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TTL_SECS: u64 = 300;

/// Daemon configuration persisted as `config.toml` in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    pub admin_token: String,
    #[serde(default)]
    pub setup_complete: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_ttl")]
    pub connect_ttl_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Directory the config was loaded from; also holds the database.
    #[serde(skip)]
    pub data_dir: PathBuf,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: ProviderSettings,
}

/// Per-provider settings. Each adapter reads only the keys it understands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ProviderConfig {
    fn new(kind: &str, name: &str, enabled: bool) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            enabled,
            settings: ProviderSettings::default(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_connect_ttl() -> u64 {
    DEFAULT_CONNECT_TTL_SECS
}

/// `~/.plug-my-ai`, or a relative `.plug-my-ai` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DATA_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

impl Config {
    /// Fresh configuration with a newly minted admin token.
    pub fn new_default(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_token: ids::admin_token(),
            setup_complete: false,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_ttl_secs: DEFAULT_CONNECT_TTL_SECS,
            providers: vec![
                ProviderConfig::new("claude-code", "Claude Code", true),
                ProviderConfig::new("codex", "Codex", false),
                ProviderConfig::new("openai-compat", "OpenAI Compatible", false),
            ],
            data_dir: data_dir.into(),
        }
    }

    /// Parse configuration from TOML.
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        toml::from_str(src).map_err(ConfigError::from)
    }

    /// Load `config.toml` from `dir`, writing defaults when it does not exist.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let src = match std::fs::read_to_string(&path) {
            Ok(src) => src,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::new_default(dir);
                cfg.save()?;
                return Ok(cfg);
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let mut cfg = Self::from_toml(&src)?;
        cfg.data_dir = dir.to_path_buf();
        Ok(cfg)
    }

    /// Write the configuration back to `data_dir/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let src = toml::to_string_pretty(self)?;
        let path = self.path();
        std::fs::write(&path, src)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    /// Path of the SQLite database next to the config file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("plug-my-ai.db")
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Errors that can occur when working with configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}
