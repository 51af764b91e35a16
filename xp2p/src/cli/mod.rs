//! Command-line plumbing shared by the `server` and `client` commands

pub mod client;
pub mod server;

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::errors::Xp2pError;
use crate::logs::{init_logging, LogLevel, LogOptions};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// `--key=value` flags; bare `--flag` maps to `"true"`
pub type Flags = HashMap<String, String>;

/// Split arguments into command words and flags
pub fn parse_args(args: impl IntoIterator<Item = String>) -> (Vec<String>, Flags) {
    let mut commands = Vec::new();
    let mut flags = Flags::new();

    for arg in args {
        if !arg.starts_with('-') {
            commands.push(arg);
        } else if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            flags.insert(clean_key.to_string(), value.to_string());
        } else {
            // Handle standalone flags like --once
            let clean_key = arg.trim_start_matches('-');
            flags.insert(clean_key.to_string(), "true".to_string());
        }
    }
    (commands, flags)
}

/// Trimmed flag value, empty when absent
pub fn flag<'a>(flags: &'a Flags, key: &str) -> &'a str {
    flags.get(key).map(|v| v.trim()).unwrap_or_default()
}

pub fn flag_bool(flags: &Flags, key: &str, default: bool) -> Result<bool, Xp2pError> {
    match flag(flags, key).to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Xp2pError::ConfigError(format!(
            "--{key}: expected a boolean, got {other:?}"
        ))),
    }
}

/// Load the settings file named by `XP2P_CONFIG`, else `./xp2p.json`
pub async fn load_settings() -> Result<Settings, Xp2pError> {
    let file = StorageLayout::settings_file();
    let settings = Settings::load(&file).await?;
    Ok(settings)
}

/// Initialize logging from settings, letting `--log-level` override
pub fn init(settings: &Settings, flags: &Flags) -> Option<WorkerGuard> {
    let log_level = match flag(flags, "log-level").parse::<LogLevel>() {
        Ok(level) => level,
        Err(_) => settings.logging.level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        log_dir: settings.logging.log_dir.as_ref().map(PathBuf::from),
        json_format: settings.logging.json,
        ..Default::default()
    };
    match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    }
}

/// Resolve once SIGINT, SIGTERM or Ctrl+C arrives
pub async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl+C received, shutting down...");
                    }
                }
            }
            _ => {
                warn!("Unable to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
