use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Where and how the catalog is queried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_accounts_base")]
    pub accounts_base: String,
    /// ISO 3166-1 alpha-2 market passed to search, if any.
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Directory holding staged preview payloads while they play.
    #[serde(default = "platform::staging_dir")]
    pub staging_dir: PathBuf,
    /// Upper bound on a single staged preview.  Previews are ~30 s MP3s, so
    /// anything past this is not a preview.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// A Playing session that hears nothing terminal from the transport
    /// within this many seconds is forced back to Idle.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    #[serde(default = "default_voice_timeout_secs")]
    pub voice_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            accounts_base: default_accounts_base(),
            market: None,
            resolve_timeout_secs: default_resolve_timeout_secs(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            staging_dir: platform::staging_dir(),
            max_bytes: default_max_bytes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_bridge_port(),
            voice_timeout_secs: default_voice_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl CatalogConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

impl PreviewConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl PlaybackConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl BridgeConfig {
    pub fn voice_timeout(&self) -> Duration {
        Duration::from_secs(self.voice_timeout_secs)
    }
}

fn default_api_base() -> String {
    "https://api.spotify.com".to_string()
}

fn default_accounts_base() -> String {
    "https://accounts.spotify.com".to_string()
}

fn default_resolve_timeout_secs() -> u64 {
    10
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_deadline_secs() -> u64 {
    120
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bridge_port() -> u16 {
    platform::BRIDGE_TCP_PORT
}

fn default_voice_timeout_secs() -> u64 {
    5
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8990
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

/// Client-credentials for the catalog.  Read from the environment only, never
/// from the config file.
#[derive(Clone)]
pub struct CatalogCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Carried for parity with the authorization-code flow; the
    /// client-credentials grant does not use it.
    pub redirect_uri: Option<String>,
}

impl CatalogCredentials {
    /// Returns `None` when either the id or the secret is missing or blank.
    pub fn from_env() -> Option<Self> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Some(Self {
            client_id: read(platform::ENV_CLIENT_ID)?,
            client_secret: read(platform::ENV_CLIENT_SECRET)?,
            redirect_uri: read(platform::ENV_REDIRECT_URI),
        })
    }
}

impl std::fmt::Debug for CatalogCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}
