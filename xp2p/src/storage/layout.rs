//! Storage layout and protocol defaults

use std::path::{Path, PathBuf};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Settings file name
pub const SETTINGS_FILE: &str = "xp2p.json";

/// Environment variable overriding the settings file location
pub const CONFIG_ENV: &str = "XP2P_CONFIG";

pub const DEFAULT_DEPLOY_PORT: u16 = 62025;
pub const DEFAULT_TROJAN_PORT: &str = "58443";
pub const DEFAULT_SERVER_CONFIG_DIR: &str = "config-server";
pub const DEFAULT_CLIENT_CONFIG_DIR: &str = "config-client";
pub const DEFAULT_SOCKS_ADDRESS: &str = "127.0.0.1:51080";

/// Storage layout for one xp2p installation
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Installation directory
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Settings file, honouring `XP2P_CONFIG`, else `./xp2p.json`
    pub fn settings_file() -> File {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => File::new(path.trim()),
            _ => File::new(SETTINGS_FILE),
        }
    }

    /// Config directory; absolute paths are used as-is
    pub fn config_dir(&self, config_dir: &str) -> Dir {
        Dir::new(config_path(&self.base_dir, config_dir))
    }

    /// Default installation directory: `$HOME/xp2p`, else `<tmp>/xp2p`
    pub fn default_install_dir() -> PathBuf {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .filter(|h| !h.is_empty());
        match home {
            Some(home) => PathBuf::from(home).join("xp2p"),
            None => std::env::temp_dir().join("xp2p"),
        }
    }
}

/// Join `config_dir` under `install_dir` unless it is already absolute
pub fn config_path(install_dir: impl AsRef<Path>, config_dir: &str) -> PathBuf {
    let config = Path::new(config_dir);
    if config.is_absolute() {
        config.to_path_buf()
    } else {
        install_dir.as_ref().join(config)
    }
}
