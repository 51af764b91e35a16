//! `xp2p server deploy` and `xp2p server run`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use secrecy::SecretString;
use tracing::info;

use crate::cli::{await_shutdown_signal, flag, flag_bool, Flags};
use crate::deploy::link;
use crate::deploy::listener::{self, DeployListener};
use crate::deploy::provision::StateProvisioner;
use crate::engine;
use crate::errors::Xp2pError;
use crate::storage::layout::{StorageLayout, DEFAULT_SERVER_CONFIG_DIR, DEFAULT_TROJAN_PORT};
use crate::storage::settings::Settings;
use crate::utils::first_non_empty;

/// Build listener options from flags, then settings, then defaults
pub fn deploy_options(settings: &Settings, flags: &Flags) -> Result<listener::Options, Xp2pError> {
    let defaults = listener::Options::default();

    let expected = match flag(flags, "link") {
        "" => None,
        raw => Some(link::parse(raw)?),
    };
    let token = Some(flag(flags, "token"))
        .filter(|t| !t.is_empty())
        .map(|t| SecretString::from(t.to_string()));
    let host = Some(first_non_empty(&[flag(flags, "host"), &settings.server.host]))
        .filter(|h| !h.is_empty());

    Ok(listener::Options {
        listen_addr: first_non_empty(&[
            flag(flags, "listen"),
            &format!("0.0.0.0:{}", settings.server.deploy_port),
        ]),
        token,
        expected,
        host,
        once: flag_bool(flags, "once", defaults.once)?,
        idle_timeout: secs_flag(flags, "idle-timeout", defaults.idle_timeout)?,
        io_timeout: secs_flag(flags, "io-timeout", defaults.io_timeout)?,
        install_dir: first_non_empty(&[
            flag(flags, "install-dir"),
            &settings.server.install_dir,
            &StorageLayout::default_install_dir().to_string_lossy(),
        ]),
        config_dir: first_non_empty(&[
            flag(flags, "config-dir"),
            &settings.server.config_dir,
            DEFAULT_SERVER_CONFIG_DIR,
        ]),
        trojan_port: first_non_empty(&[
            flag(flags, "trojan-port"),
            &settings.server.trojan_port,
            DEFAULT_TROJAN_PORT,
        ]),
    })
}

fn secs_flag(flags: &Flags, key: &str, default: Duration) -> Result<Duration, Xp2pError> {
    match flag(flags, key) {
        "" => Ok(default),
        value => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Xp2pError::ConfigError(format!("--{key}: invalid seconds {value:?}"))),
    }
}

/// Serve deploy handshakes; with `--run`, start the engine after a success
pub async fn deploy(settings: &Settings, flags: &Flags) -> Result<(), Xp2pError> {
    let options = deploy_options(settings, flags)?;
    let run_after = flag_bool(flags, "run", false)?;
    let install_dir = options.install_dir.clone();
    let config_dir = options.config_dir.clone();

    let listener = DeployListener::bind(options, Arc::new(StateProvisioner::new())).await?;
    println!(
        "{} deploy listener on {}",
        "[xp2p]".cyan().bold(),
        listener.local_addr()?
    );

    let outcome = listener.run(Box::pin(await_shutdown_signal())).await?;
    let Some(outcome) = outcome else {
        println!("{} no deploy handshake completed", "[xp2p]".yellow().bold());
        return Ok(());
    };
    println!(
        "\n{} server provisioned in {}",
        "[SUCCESS]".green().bold(),
        outcome.install_dir.as_deref().unwrap_or(&install_dir)
    );

    if run_after {
        let install_dir = outcome.install_dir.unwrap_or(install_dir);
        let config_dir = outcome.config_dir.unwrap_or(config_dir);
        return run_engine(&PathBuf::from(install_dir), &config_dir).await;
    }
    Ok(())
}

/// Run the engine for the server configuration
pub async fn run(settings: &Settings, flags: &Flags) -> Result<(), Xp2pError> {
    let install_dir = first_non_empty(&[
        flag(flags, "install-dir"),
        &settings.server.install_dir,
        &StorageLayout::default_install_dir().to_string_lossy(),
    ]);
    let config_dir = first_non_empty(&[flag(flags, "config-dir"), &settings.server.config_dir]);
    run_engine(&PathBuf::from(install_dir), &config_dir).await
}

async fn run_engine(install_dir: &std::path::Path, config_dir: &str) -> Result<(), Xp2pError> {
    info!(install_dir = %install_dir.display(), config_dir, "Starting server engine");
    let child = engine::spawn(install_dir, config_dir)?;
    engine::run_until(child, Box::pin(await_shutdown_signal())).await
}
