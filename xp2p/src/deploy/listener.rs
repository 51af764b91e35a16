//! TCP deploy listener
//!
//! Accepts deploy handshakes until shutdown, an idle timeout, or (in once
//! mode) the first finished handshake. Each connection runs in its own task;
//! in-flight sessions are awaited before [`DeployListener::run`] returns.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::link::EncryptedLink;
use crate::deploy::provision::Provisioner;
use crate::deploy::session::{handle_connection, SessionOutcome};
use crate::errors::Xp2pError;
use crate::storage::layout::{DEFAULT_DEPLOY_PORT, DEFAULT_SERVER_CONFIG_DIR, DEFAULT_TROJAN_PORT};

/// Deploy listener options
#[derive(Debug, Clone)]
pub struct Options {
    /// Address to bind, `host:port`
    pub listen_addr: String,

    /// Shared AUTH token; `None` accepts any token
    pub token: Option<SecretString>,

    /// Link the manifest ciphertext must open under
    pub expected: Option<EncryptedLink>,

    /// Pinned tunnel host; defaults to the expected link's host
    pub host: Option<String>,

    /// Stop after the first finished handshake
    pub once: bool,

    /// Stop when nothing connects for this long; zero disables
    pub idle_timeout: Duration,

    /// Per-operation read/write timeout
    pub io_timeout: Duration,

    /// Install directory used when the manifest carries none
    pub install_dir: String,

    /// Server config directory, relative to the install directory
    pub config_dir: String,

    /// Trojan port used when the manifest carries none
    pub trojan_port: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_DEPLOY_PORT}"),
            token: None,
            expected: None,
            host: None,
            once: true,
            idle_timeout: Duration::from_secs(10 * 60),
            io_timeout: Duration::from_secs(60),
            install_dir: String::new(),
            config_dir: DEFAULT_SERVER_CONFIG_DIR.to_string(),
            trojan_port: DEFAULT_TROJAN_PORT.to_string(),
        }
    }
}

/// Bound deploy listener
pub struct DeployListener {
    listener: TcpListener,
    options: Arc<Options>,
    provisioner: Arc<dyn Provisioner>,
}

impl DeployListener {
    /// Bind the listen address
    pub async fn bind(
        options: Options,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, Xp2pError> {
        let listener = TcpListener::bind(&options.listen_addr).await.map_err(|e| {
            Xp2pError::ConfigError(format!("listen on {}: {}", options.listen_addr, e))
        })?;
        Ok(Self {
            listener,
            options: Arc::new(options),
            provisioner,
        })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Result<SocketAddr, Xp2pError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve handshakes until shutdown, idle timeout or, in once mode, the
    /// first finished handshake. Returns the last successful outcome.
    pub async fn run(
        self,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<Option<SessionOutcome>, Xp2pError> {
        let idle_timeout = self.options.idle_timeout;
        let idle_enabled = !idle_timeout.is_zero();
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        if let Ok(addr) = self.listener.local_addr() {
            info!("Deploy listener accepting on {}", addr);
        }
        if let Some(expected) = &self.options.expected {
            debug!("Expecting manifests for {}", expected.redacted());
        }

        let mut sessions: JoinSet<(SocketAddr, SessionOutcome)> = JoinSet::new();
        let mut last_success = None;
        let mut accept_error = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Deploy listener shutting down...");
                    break;
                }
                _ = &mut idle, if idle_enabled => {
                    info!("Deploy listener idle for {:?}, stopping", idle_timeout);
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    let Some(outcome) = record(joined, &mut last_success) else {
                        continue;
                    };
                    if self.options.once {
                        info!("Handshake finished ({:?}), once mode set", outcome.state);
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Deploy connection from {}", peer);
                            if idle_enabled {
                                idle.as_mut().reset(Instant::now() + idle_timeout);
                            }
                            let options = self.options.clone();
                            let provisioner = self.provisioner.clone();
                            sessions.spawn(async move {
                                let outcome =
                                    handle_connection(stream, &options, provisioner.as_ref()).await;
                                (peer, outcome)
                            });
                        }
                        Err(e) => {
                            error!("Deploy listener accept failed: {}", e);
                            accept_error = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        while let Some(joined) = sessions.join_next().await {
            record(joined, &mut last_success);
        }

        match accept_error {
            Some(e) => Err(e.into()),
            None => Ok(last_success),
        }
    }
}

fn record(
    joined: Result<(SocketAddr, SessionOutcome), tokio::task::JoinError>,
    last_success: &mut Option<SessionOutcome>,
) -> Option<SessionOutcome> {
    match joined {
        Ok((peer, outcome)) => {
            if outcome.is_success() {
                info!(
                    peer = %peer,
                    install_dir = outcome.install_dir.as_deref().unwrap_or_default(),
                    "Deploy handshake succeeded"
                );
                *last_success = Some(outcome.clone());
            } else {
                warn!(
                    peer = %peer,
                    reason = outcome.reason.as_deref().unwrap_or_default(),
                    "Deploy handshake failed"
                );
            }
            Some(outcome)
        }
        Err(e) => {
            error!("Deploy session task failed: {}", e);
            None
        }
    }
}
