//! Proxy engine process (xray-core)

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::deploy::remote::find_executable;
use crate::errors::Xp2pError;
use crate::storage::layout::config_path;

/// Engine binary name
pub const ENGINE_BINARY: &str = "xray";

/// Engine binary: `<install_dir>/bin/xray`, else `xray` on PATH
pub fn resolve_binary(install_dir: &Path) -> Result<PathBuf, Xp2pError> {
    let bundled = install_dir.join("bin");
    for name in [ENGINE_BINARY, "xray.exe"] {
        let candidate = bundled.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    find_executable(&[ENGINE_BINARY, "xray.exe"]).ok_or_else(|| {
        Xp2pError::EngineError(format!(
            "{ENGINE_BINARY} not found in {} or PATH",
            bundled.display()
        ))
    })
}

/// Arguments for `xray run` against a config directory
pub fn run_args(config_dir: &Path) -> Vec<String> {
    vec![
        "run".to_string(),
        "-confdir".to_string(),
        config_dir.to_string_lossy().into_owned(),
    ]
}

/// Start the engine on `<install_dir>/<config_dir>`
pub fn spawn(install_dir: &Path, config_dir: &str) -> Result<Child, Xp2pError> {
    let confdir = config_path(install_dir, config_dir);
    if !confdir.is_dir() {
        return Err(Xp2pError::EngineError(format!(
            "config directory {} does not exist",
            confdir.display()
        )));
    }
    let binary = resolve_binary(install_dir)?;
    let child = Command::new(&binary)
        .args(run_args(&confdir))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Xp2pError::EngineError(format!("start {}: {}", binary.display(), e)))?;
    info!(pid = child.id(), confdir = %confdir.display(), "Engine started");
    Ok(child)
}

/// Wait for the engine to exit or for shutdown, killing it on shutdown
pub async fn run_until(
    mut child: Child,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), Xp2pError> {
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("Engine exited");
                Ok(())
            } else {
                Err(Xp2pError::EngineError(format!("engine exited with {status}")))
            }
        }
        _ = &mut shutdown_signal => {
            info!("Stopping engine...");
            if let Err(e) = child.kill().await {
                warn!("Failed to stop engine: {}", e);
            }
            Ok(())
        }
    }
}
