use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::channel::ReconnectPolicy;
use crate::error::ConfigError;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     ws_url = "wss://chat.example.com/ws"
//                    reconnect_max_attempts = 8
//
//   env var:         CHAT_SYNC_WS_URL=wss://chat.example.com/ws

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Send over HTTP when the socket is not OPEN. Off by default.
    #[serde(default)]
    pub rest_fallback: bool,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            user_id: default_user_id(),
            reconnect_max_attempts: default_max_attempts(),
            reconnect_base_delay_ms: default_base_delay_ms(),
            rest_fallback: false,
            token: None,
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_rest_url() -> String {
    "http://localhost:8000/chat".to_string()
}
fn default_user_id() -> String {
    "anonymous".to_string()
}
fn default_max_attempts() -> u32 {
    crate::channel::DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    crate::channel::DEFAULT_BASE_DELAY.as_millis() as u64
}

/// Build a figment that layers: defaults → config.toml → CHAT_SYNC_* env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_SYNC_"))
}

// =============================================================================
// Runtime config (validated view of FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub user_id: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub rest_fallback: bool,
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        check_scheme("ws_url", &fc.ws_url, &["ws", "wss"], "ws:// or wss://")?;
        check_scheme("rest_url", &fc.rest_url, &["http", "https"], "http:// or https://")?;
        if fc.reconnect_max_attempts == 0 {
            return Err(ConfigError::NoReconnectAttempts);
        }

        Ok(Self {
            ws_url: fc.ws_url.clone(),
            rest_url: fc.rest_url.clone(),
            user_id: fc.user_id.clone(),
            reconnect_max_attempts: fc.reconnect_max_attempts,
            reconnect_base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
            rest_fallback: fc.rest_fallback,
            token: fc.token.clone().filter(|t| !t.is_empty()),
        })
    }

    /// Extract and validate in one step.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let fc: FileConfig = load_config(data_dir).extract().map_err(Box::new)?;
        Self::from_file(&fc)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_max_attempts, self.reconnect_base_delay)
    }
}

fn check_scheme(
    field: &'static str,
    url: &str,
    allowed: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    if !allowed.contains(&parsed.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            field,
            expected,
            scheme: parsed.scheme().to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Directory layout (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DataDir {
    pub root: PathBuf,
}

impl DataDir {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let root = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-sync"),
        };

        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create data directory: {:?}", root))?;

        info!("Data directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join("conversations.json")
    }
}
