//! `xp2p client deploy` and `xp2p client run`

use std::path::PathBuf;

use colored::Colorize;
use tracing::info;

use crate::cli::{await_shutdown_signal, flag, Flags};
use crate::deploy::local::{ClientState, HostRuntime};
use crate::deploy::orchestrator::{Options, Orchestrator};
use crate::deploy::remote::OpenSsh;
use crate::engine;
use crate::errors::Xp2pError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::first_non_empty;

/// Bootstrap a remote server and the local client
pub async fn deploy(settings: &Settings, flags: &Flags) -> Result<(), Xp2pError> {
    let options = Options::resolve(settings, flags)?;
    let orchestrator = Orchestrator::new(options, OpenSsh::default(), HostRuntime::new());

    println!(
        "{} deploying to {}",
        "[xp2p]".cyan().bold(),
        orchestrator.options().ssh.address()
    );

    let report = orchestrator.run(Box::pin(await_shutdown_signal())).await?;

    println!("\n{} tunnel is up ({:?})", "[SUCCESS]".green().bold(), report.ping);
    println!("Connection link: {}", report.link);
    Ok(())
}

/// Run the engine for the installed client configuration
pub async fn run(settings: &Settings, flags: &Flags) -> Result<(), Xp2pError> {
    let install_dir = PathBuf::from(first_non_empty(&[
        flag(flags, "install-dir"),
        &settings.client.install_dir,
        &StorageLayout::default_install_dir().to_string_lossy(),
    ]));
    let config_dir = first_non_empty(&[flag(flags, "config-dir"), &settings.client.config_dir]);

    let state = ClientState::file(&install_dir, &config_dir);
    if !state.exists().await {
        return Err(Xp2pError::ConfigError(format!(
            "client is not installed ({} missing)",
            state.path().display()
        )));
    }

    info!(install_dir = %install_dir.display(), config_dir = %config_dir, "Starting client engine");
    let child = engine::spawn(&install_dir, &config_dir)?;
    engine::run_until(child, Box::pin(await_shutdown_signal())).await
}
