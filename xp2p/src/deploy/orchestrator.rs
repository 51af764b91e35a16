//! Client-side deploy orchestrator
//!
//! Drives a remote bootstrap over SSH:
//!
//! 1. resolve options
//! 2. check local prerequisites
//! 3. locate the local executable
//! 4. mirror it on the remote host (skipped when the hashes match)
//! 5. start a one-shot deploy listener remotely and run the handshake
//! 6. optionally save the connection link
//! 7. install the local client from the link
//! 8. start the remote server, then the local client
//! 9. wait for the tunnel and ping through it
//! 10. release the local client
//!
//! Failures from step 8 on stop the local client and then the remote
//! server before the error is returned. Earlier artifacts are left in place.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cli::{self, Flags};
use crate::deploy::client::{handshake, DeployResult};
use crate::deploy::link::{self, redact};
use crate::deploy::local::{ClientState, LocalRuntime};
use crate::deploy::manifest::{Manifest, CURRENT_VERSION};
use crate::deploy::remote::{sh_quote, RemoteExec, SshTarget};
use crate::deploy::trojan::TrojanLink;
use crate::errors::{DeployStep, Xp2pError};
use crate::filesys::file::File;
use crate::netutil::validate_host;
use crate::storage::layout::{StorageLayout, DEFAULT_TROJAN_PORT};
use crate::storage::settings::Settings;
use crate::utils::{calc_exp_backoff, first_non_empty, generate_secret, sha256_hash, CooldownOptions};

/// Name of the binary on the remote host, inside its install directory
pub const REMOTE_BINARY: &str = "xp2p";

/// Default remote install directory, relative to the SSH user's home
pub const DEFAULT_REMOTE_INSTALL_DIR: &str = "xp2p";

/// How the handshake reaches the remote deploy listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Channel {
    /// Connect to `<remote_host>:<deploy_port>`
    #[default]
    Direct,

    /// Tunnel the deploy port through an SSH local forward
    Ssh,
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Channel::Direct),
            "ssh" => Ok(Channel::Ssh),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct Options {
    /// Host reached over SSH
    pub ssh: SshTarget,

    pub deploy_port: u16,

    /// Host advertised in the connection link
    pub server_host: String,

    pub trojan_port: String,
    pub user: String,
    pub password: SecretString,

    pub remote_install_dir: String,
    pub remote_config_dir: String,
    pub local_install_dir: PathBuf,
    pub local_config_dir: String,

    pub socks_address: String,

    /// `host:port` probed through the tunnel
    pub ping_target: String,

    /// Write the connection link here
    pub save_link: Option<PathBuf>,

    pub channel: Channel,
    pub link_ttl: Duration,

    /// Give up retrying the handshake after this long
    pub handshake_timeout: Duration,

    pub io_timeout: Duration,

    /// Wait between starting both ends and the ping
    pub startup_grace: Duration,

    pub ping_timeout: Duration,
}

impl Options {
    /// Resolve options from flags, then settings, then defaults
    pub fn resolve(settings: &Settings, flags: &Flags) -> Result<Self, Xp2pError> {
        let invalid = |msg: String| Xp2pError::at(DeployStep::Validate, msg);
        let flag = |key: &str| cli::flag(flags, key);

        let remote_host = flag("remote-host");
        if remote_host.is_empty() || remote_host.starts_with('-') {
            return Err(invalid("--remote-host is required".to_string()));
        }
        validate_host(remote_host).map_err(|e| invalid(format!("--remote-host: {e}")))?;

        let server_host = first_non_empty(&[flag("server-host"), &settings.server.host, remote_host]);
        validate_host(&server_host).map_err(|e| invalid(format!("--server-host: {e}")))?;

        let trojan_port = first_non_empty(&[
            flag("trojan-port"),
            &settings.server.trojan_port,
            DEFAULT_TROJAN_PORT,
        ]);
        if trojan_port.parse::<u16>().map_or(true, |p| p == 0) {
            return Err(invalid(format!("--trojan-port: invalid port {trojan_port:?}")));
        }

        let user = first_non_empty(&[flag("user"), &settings.client.user]);
        if user.is_empty() {
            return Err(invalid("--user is required".to_string()));
        }
        let settings_password = settings
            .client
            .password
            .as_ref()
            .map(|p| p.expose_secret())
            .unwrap_or_default();
        let password = match first_non_empty(&[flag("password"), settings_password]) {
            p if p.is_empty() => generate_secret(18),
            p => p,
        };

        let ssh_port = parse_port(flag("ssh-port"), 22).map_err(|e| invalid(format!("--ssh-port: {e}")))?;
        let deploy_port = parse_port(flag("deploy-port"), settings.server.deploy_port)
            .map_err(|e| invalid(format!("--deploy-port: {e}")))?;

        let local_install_dir = match first_non_empty(&[flag("install-dir"), &settings.client.install_dir]) {
            d if d.is_empty() => StorageLayout::default_install_dir(),
            d => PathBuf::from(d),
        };

        let channel = match flag("channel") {
            "" => Channel::default(),
            value => value.parse().map_err(invalid)?,
        };

        let save_link = Some(flag("save-link"))
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let defaults = Self::default_timings();
        Ok(Self {
            ssh: SshTarget {
                user: flag("ssh-user").to_string(),
                host: remote_host.to_string(),
                port: ssh_port,
            },
            deploy_port,
            server_host,
            trojan_port: trojan_port.clone(),
            user,
            password: SecretString::from(password),
            remote_install_dir: first_non_empty(&[
                flag("remote-install-dir"),
                &settings.server.install_dir,
                DEFAULT_REMOTE_INSTALL_DIR,
            ]),
            remote_config_dir: first_non_empty(&[
                flag("remote-config-dir"),
                &settings.server.config_dir,
            ]),
            local_install_dir,
            local_config_dir: first_non_empty(&[flag("config-dir"), &settings.client.config_dir]),
            socks_address: first_non_empty(&[flag("socks-address"), &settings.client.socks_address]),
            ping_target: first_non_empty(&[
                flag("ping-target"),
                &settings.client.ping_target,
                &format!("127.0.0.1:{trojan_port}"),
            ]),
            save_link,
            channel,
            link_ttl: parse_secs(flag("ttl"), defaults.link_ttl).map_err(|e| invalid(format!("--ttl: {e}")))?,
            handshake_timeout: parse_secs(flag("handshake-timeout"), defaults.handshake_timeout)
                .map_err(|e| invalid(format!("--handshake-timeout: {e}")))?,
            io_timeout: defaults.io_timeout,
            startup_grace: defaults.startup_grace,
            ping_timeout: defaults.ping_timeout,
        })
    }

    fn default_timings() -> Timings {
        Timings {
            link_ttl: Duration::from_secs(10 * 60),
            handshake_timeout: Duration::from_secs(10 * 60),
            io_timeout: Duration::from_secs(60),
            startup_grace: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(3),
        }
    }

    /// Remote path of the xp2p binary
    pub fn remote_binary(&self) -> String {
        format!(
            "{}/{}",
            self.remote_install_dir.trim_end_matches('/'),
            REMOTE_BINARY
        )
    }
}

struct Timings {
    link_ttl: Duration,
    handshake_timeout: Duration,
    io_timeout: Duration,
    startup_grace: Duration,
    ping_timeout: Duration,
}

fn parse_port(value: &str, default: u16) -> Result<u16, String> {
    if value.is_empty() {
        return Ok(default);
    }
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("invalid port {value:?}")),
    }
}

fn parse_secs(value: &str, default: Duration) -> Result<Duration, String> {
    if value.is_empty() {
        return Ok(default);
    }
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(format!("invalid seconds {value:?}")),
    }
}

/// Outcome of a finished deploy
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub link: String,

    /// Whether the binary had to be uploaded
    pub uploaded: bool,

    /// Round trip of the connectivity check
    pub ping: Duration,
}

/// Rollback guard for steps 8 and on
struct Started<P> {
    remote: bool,
    local: Option<P>,
}

pub struct Orchestrator<R, L> {
    options: Options,
    remote: R,
    local: L,
}

impl<R, L> Orchestrator<R, L>
where
    R: RemoteExec,
    L: LocalRuntime,
{
    pub fn new(options: Options, remote: R, local: L) -> Self {
        Self {
            options,
            remote,
            local,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Run every step, rolling back on late failures.
    ///
    /// `shutdown_signal` aborts the deploy. Once step 8 has begun, an abort
    /// goes through the same rollback as a failure.
    pub async fn run(
        &self,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<DeployReport, Xp2pError> {
        let (link, uploaded) = tokio::select! {
            prepared = self.prepare() => prepared?,
            _ = &mut shutdown_signal => {
                warn!("Client deploy interrupted before start");
                return Err(interrupted());
            }
        };

        let mut started = Started {
            remote: false,
            local: None,
        };
        let outcome = tokio::select! {
            outcome = self.start_and_verify(&mut started) => outcome,
            _ = &mut shutdown_signal => Err(interrupted()),
        };
        match outcome {
            Ok(ping) => {
                if let Some(process) = started.local.take() {
                    self.local.release_client(process);
                }
                info!(?ping, "Client deploy finished");
                Ok(DeployReport {
                    link,
                    uploaded,
                    ping,
                })
            }
            Err(e) => {
                error!("Client deploy failed: {}", e);
                self.rollback(started).await;
                Err(e)
            }
        }
    }

    /// Steps 2 to 7; returns the connection link and whether an upload happened
    async fn prepare(&self) -> Result<(String, bool), Xp2pError> {
        let opts = &self.options;
        info!(
            remote_host = %opts.ssh.host,
            server_host = %opts.server_host,
            "Starting client deploy"
        );

        self.remote
            .check_prerequisites()
            .await
            .map_err(|e| Xp2pError::at(DeployStep::Prerequisites, e))?;

        let exe = self
            .local
            .executable()
            .map_err(|e| Xp2pError::at(DeployStep::Executable, e))?;

        let uploaded = ensure_remote_binary(&self.remote, &opts.ssh, &exe, &opts.remote_binary())
            .await
            .map_err(|e| Xp2pError::at(DeployStep::Upload, e))?;

        let result = self
            .provision_remote()
            .await
            .map_err(|e| Xp2pError::at(DeployStep::Provision, e))?;
        let link = result.link;

        if let Some(path) = &opts.save_link {
            save_link(path, &link)
                .await
                .map_err(|e| Xp2pError::at(DeployStep::SaveLink, e))?;
            info!(path = %path.display(), "Connection link saved");
        }

        self.install_local(&link)
            .await
            .map_err(|e| Xp2pError::at(DeployStep::LocalInstall, e))?;
        Ok((link, uploaded))
    }

    async fn start_and_verify(&self, started: &mut Started<L::Process>) -> Result<Duration, Xp2pError> {
        let opts = &self.options;

        self.start_remote_server()
            .await
            .map_err(|e| Xp2pError::at(DeployStep::StartRemote, e))?;
        started.remote = true;

        let process = self
            .local
            .start_client(&opts.local_install_dir, &opts.local_config_dir)
            .await
            .map_err(|e| Xp2pError::at(DeployStep::StartLocal, e))?;
        started.local = Some(process);

        self.local.sleep(opts.startup_grace).await;
        let ping = self
            .local
            .ping(&opts.socks_address, &opts.ping_target, opts.ping_timeout)
            .await
            .map_err(|e| Xp2pError::at(DeployStep::Connectivity, e))?;
        info!(?ping, target = %opts.ping_target, "Ping through tunnel succeeded");
        Ok(ping)
    }

    async fn rollback(&self, started: Started<L::Process>) {
        if let Some(process) = started.local {
            info!("Rolling back: stopping local client");
            self.local.stop_client(process).await;
        }
        if started.remote {
            info!("Rolling back: stopping remote server");
            let command = format!(
                "pkill -f {} || true",
                sh_quote(&pkill_pattern(&format!(
                    "{} server run",
                    self.options.remote_binary()
                )))
            );
            match self.remote.exec(&self.options.ssh, &command).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("Remote stop exited with status {}", out.status),
                Err(e) => warn!("Remote stop failed: {}", e),
            }
        }
    }

    /// Start the remote listener and run the handshake against it
    pub async fn provision_remote(&self) -> Result<DeployResult, Xp2pError> {
        let opts = &self.options;
        let manifest = Manifest {
            host: opts.server_host.clone(),
            version: CURRENT_VERSION,
            install_dir: opts.remote_install_dir.clone(),
            trojan_port: opts.trojan_port.clone(),
            trojan_user: opts.user.clone(),
            trojan_password: opts.password.expose_secret().to_string(),
            expires_at: 0,
        };
        let (link, enc) = link::build(&opts.ssh.host, manifest, opts.link_ttl)?;
        let token = generate_secret(24);
        info!("Deploy link generated: {}", redact(&link));

        let mut command = vec![
            "nohup".to_string(),
            sh_quote(&opts.remote_binary()),
            "server".to_string(),
            "deploy".to_string(),
            sh_quote(&format!("--listen=0.0.0.0:{}", opts.deploy_port)),
            sh_quote(&format!("--link={link}")),
            sh_quote(&format!("--token={token}")),
            "--once".to_string(),
        ];
        if !opts.remote_config_dir.is_empty() {
            command.push(sh_quote(&format!("--config-dir={}", opts.remote_config_dir)));
        }
        command.push(">/dev/null 2>&1 &".to_string());
        self.remote
            .exec(&opts.ssh, &command.join(" "))
            .await?
            .check("start remote deploy listener")?;

        let (addr, forward) = match opts.channel {
            Channel::Direct => (join_host_port(&opts.ssh.host, opts.deploy_port), None),
            Channel::Ssh => {
                let local_port = free_local_port().await?;
                let guard = self
                    .remote
                    .forward(&opts.ssh, local_port, opts.deploy_port)
                    .await?;
                (format!("127.0.0.1:{local_port}"), Some(guard))
            }
        };
        info!(addr = %addr, "Waiting for remote deploy listener");

        let result = self.handshake_until_deadline(&addr, &token, &enc.ciphertext).await;
        if let Some(guard) = forward {
            guard.close().await;
        }
        let result = result?;

        if result.exit_code != 0 {
            let detail = first_non_empty(&[&result.err_log, &result.out_log]);
            return Err(Xp2pError::ProvisionError(format!(
                "server install failed with exit code {}: {}",
                result.exit_code, detail
            )));
        }
        if result.link.trim().is_empty() {
            return Err(Xp2pError::ProvisionError(
                "missing connection link from server".to_string(),
            ));
        }
        Ok(result)
    }

    async fn handshake_until_deadline(
        &self,
        addr: &str,
        token: &str,
        ciphertext: &[u8],
    ) -> Result<DeployResult, Xp2pError> {
        let deadline = Instant::now() + self.options.handshake_timeout;
        let cooldown = CooldownOptions::default();
        let mut attempt = 0;
        loop {
            match handshake(addr, token, ciphertext, self.options.io_timeout).await {
                Ok(result) => return Ok(result),
                // The listener answered; retrying cannot change its mind
                Err(e @ Xp2pError::ProtocolError(_)) => return Err(e),
                Err(e) if Instant::now() >= deadline => {
                    return Err(Xp2pError::Timeout(format!("deploy handshake: {e}")))
                }
                Err(e) => {
                    let delay = calc_exp_backoff(&cooldown, attempt);
                    debug!("Deploy listener not ready ({}), retrying in {:?}", e, delay);
                    self.local.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn install_local(&self, link: &str) -> Result<(), Xp2pError> {
        let opts = &self.options;
        let parsed = TrojanLink::parse(link)?;
        info!(server = %parsed.address(), user = %parsed.user, "Installing local client");
        let state = ClientState::from_link(&parsed, &opts.socks_address);
        self.local
            .install_client(&opts.local_install_dir, &opts.local_config_dir, &state)
            .await
    }

    async fn start_remote_server(&self) -> Result<(), Xp2pError> {
        let opts = &self.options;
        let mut command = vec![
            "nohup".to_string(),
            sh_quote(&opts.remote_binary()),
            "server".to_string(),
            "run".to_string(),
            sh_quote(&format!("--install-dir={}", opts.remote_install_dir)),
        ];
        if !opts.remote_config_dir.is_empty() {
            command.push(sh_quote(&format!("--config-dir={}", opts.remote_config_dir)));
        }
        command.push(">/dev/null 2>&1 &".to_string());
        self.remote
            .exec(&opts.ssh, &command.join(" "))
            .await?
            .check("start remote server")?;
        info!("Remote server started");
        Ok(())
    }
}

fn interrupted() -> Xp2pError {
    Xp2pError::Internal("client deploy interrupted".to_string())
}

/// `pkill -f` pattern for `command` that does not match the shell running pkill.
/// The first alphanumeric character is wrapped in a bracket class.
pub fn pkill_pattern(command: &str) -> String {
    match command.char_indices().find(|(_, c)| c.is_ascii_alphanumeric()) {
        Some((i, c)) => format!("{}[{}]{}", &command[..i], c, &command[i + 1..]),
        None => command.to_string(),
    }
}

/// Upload `local` to `remote` unless the remote copy has the same SHA-256.
/// Returns whether an upload happened.
pub async fn ensure_remote_binary<R: RemoteExec + ?Sized>(
    remote: &R,
    target: &SshTarget,
    local: &Path,
    remote_path: &str,
) -> Result<bool, Xp2pError> {
    let local_hash = sha256_hash(&File::new(local).read_bytes().await?);

    let probe = remote
        .exec(target, &format!("sha256sum {} 2>/dev/null", sh_quote(remote_path)))
        .await?;
    let remote_hash = probe.stdout.split_whitespace().next().unwrap_or_default();
    if probe.success() && remote_hash.eq_ignore_ascii_case(&local_hash) {
        info!(remote_path, "Remote binary is up to date");
        return Ok(false);
    }

    if let Some((dir, _)) = remote_path.rsplit_once('/') {
        if !dir.is_empty() {
            remote
                .exec(target, &format!("mkdir -p {}", sh_quote(dir)))
                .await?
                .check("mkdir")?;
        }
    }
    remote.copy(target, local, remote_path).await?;
    remote
        .exec(target, &format!("chmod 0755 {}", sh_quote(remote_path)))
        .await?
        .check("chmod")?;
    info!(remote_path, "Remote binary uploaded");
    Ok(true)
}

async fn save_link(path: &Path, link: &str) -> Result<(), Xp2pError> {
    let file = File::new(path);
    file.write_string(&format!("{link}\n")).await?;
    file.set_permissions_600().await
}

async fn free_local_port() -> Result<u16, Xp2pError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
