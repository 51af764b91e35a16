//! Settings file management

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::Xp2pError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::{
    DEFAULT_CLIENT_CONFIG_DIR, DEFAULT_DEPLOY_PORT, DEFAULT_SERVER_CONFIG_DIR,
    DEFAULT_SOCKS_ADDRESS, DEFAULT_TROJAN_PORT,
};

/// xp2p settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub client: ClientSettings,
}

impl Settings {
    /// Load settings; a missing file yields defaults
    pub async fn load(file: &File) -> Result<Self, Xp2pError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            Xp2pError::ConfigError(format!("read {}: {}", file.path().display(), e))
        })
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: LogLevel,

    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json: bool,

    /// Also write logs under this directory
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Server node settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub install_dir: String,

    #[serde(default = "default_server_config_dir")]
    pub config_dir: String,

    /// Public host advertised in connection links
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_trojan_port")]
    pub trojan_port: String,

    #[serde(default = "default_deploy_port")]
    pub deploy_port: u16,
}

fn default_server_config_dir() -> String {
    DEFAULT_SERVER_CONFIG_DIR.to_string()
}

fn default_trojan_port() -> String {
    DEFAULT_TROJAN_PORT.to_string()
}

fn default_deploy_port() -> u16 {
    DEFAULT_DEPLOY_PORT
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            install_dir: String::new(),
            config_dir: default_server_config_dir(),
            host: String::new(),
            trojan_port: default_trojan_port(),
            deploy_port: default_deploy_port(),
        }
    }
}

/// Client node settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub install_dir: String,

    #[serde(default = "default_client_config_dir")]
    pub config_dir: String,

    /// Trojan user (email)
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: Option<SecretString>,

    #[serde(default = "default_socks_address")]
    pub socks_address: String,

    /// `host:port` probed through the tunnel after a deploy
    #[serde(default)]
    pub ping_target: String,
}

fn default_client_config_dir() -> String {
    DEFAULT_CLIENT_CONFIG_DIR.to_string()
}

fn default_socks_address() -> String {
    DEFAULT_SOCKS_ADDRESS.to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            install_dir: String::new(),
            config_dir: default_client_config_dir(),
            user: String::new(),
            password: None,
            socks_address: default_socks_address(),
            ping_target: String::new(),
        }
    }
}
