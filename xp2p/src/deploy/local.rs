//! Local side of a client deploy: install, start and probe the client

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::trojan::TrojanLink;
use crate::errors::Xp2pError;
use crate::filesys::file::File;
use crate::storage::layout::StorageLayout;

/// Name of the client state file inside `<install_dir>/<config_dir>`
pub const CLIENT_STATE_FILE: &str = "client-state.json";

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Client connection settings derived from a connection link
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub server_address: String,
    pub server_port: u16,
    pub user: String,
    pub password: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default)]
    pub allow_insecure: bool,

    pub socks_address: String,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("user", &self.user)
            .field("server_name", &self.server_name)
            .field("allow_insecure", &self.allow_insecure)
            .field("socks_address", &self.socks_address)
            .finish_non_exhaustive()
    }
}

impl ClientState {
    pub fn from_link(link: &TrojanLink, socks_address: &str) -> Self {
        Self {
            server_address: link.host.clone(),
            server_port: link.port,
            user: link.user.clone(),
            password: link.password.clone(),
            server_name: link.sni.clone(),
            allow_insecure: link.allow_insecure,
            socks_address: socks_address.to_string(),
        }
    }

    pub fn file(install_dir: &Path, config_dir: &str) -> File {
        StorageLayout::new(install_dir)
            .config_dir(config_dir)
            .file(CLIENT_STATE_FILE)
    }
}

/// Local operations the orchestrator drives
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    /// Handle to a started client process
    type Process: Send;

    /// Path of the executable to mirror on the remote host
    fn executable(&self) -> Result<PathBuf, Xp2pError>;

    async fn install_client(
        &self,
        install_dir: &Path,
        config_dir: &str,
        state: &ClientState,
    ) -> Result<(), Xp2pError>;

    async fn start_client(&self, install_dir: &Path, config_dir: &str)
        -> Result<Self::Process, Xp2pError>;

    /// Terminate a started client
    async fn stop_client(&self, process: Self::Process);

    /// Let a started client outlive this process
    fn release_client(&self, process: Self::Process);

    /// SOCKS5 CONNECT to `target` through `socks_address`, returning the round trip
    async fn ping(
        &self,
        socks_address: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<Duration, Xp2pError>;

    async fn sleep(&self, duration: Duration);
}

/// [`LocalRuntime`] acting on this host
#[derive(Debug, Clone, Default)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalRuntime for HostRuntime {
    type Process = Child;

    fn executable(&self) -> Result<PathBuf, Xp2pError> {
        Ok(std::env::current_exe()?)
    }

    async fn install_client(
        &self,
        install_dir: &Path,
        config_dir: &str,
        state: &ClientState,
    ) -> Result<(), Xp2pError> {
        let file = ClientState::file(install_dir, config_dir);
        file.write_json_private(state).await?;
        info!(
            install_dir = %install_dir.display(),
            config_dir,
            "Local client installed"
        );
        Ok(())
    }

    async fn start_client(&self, install_dir: &Path, config_dir: &str) -> Result<Child, Xp2pError> {
        let exe = self.executable()?;
        let child = Command::new(&exe)
            .arg("client")
            .arg("run")
            .arg(format!("--install-dir={}", install_dir.display()))
            .arg(format!("--config-dir={config_dir}"))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Xp2pError::EngineError(format!("start {}: {}", exe.display(), e)))?;
        info!(pid = child.id(), "Local client started");
        Ok(child)
    }

    async fn stop_client(&self, mut process: Child) {
        if let Err(e) = process.kill().await {
            warn!("Failed to stop local client: {}", e);
        }
    }

    fn release_client(&self, process: Child) {
        debug!(pid = process.id(), "Releasing local client");
        drop(process);
    }

    async fn ping(
        &self,
        socks_address: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<Duration, Xp2pError> {
        socks5_ping(socks_address, target, timeout).await
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Open a SOCKS5 CONNECT to `target` and report how long it took
pub async fn socks5_ping(
    socks_address: &str,
    target: &str,
    timeout: Duration,
) -> Result<Duration, Xp2pError> {
    let (host, port) = split_host_port(target)?;
    let started = Instant::now();

    let attempt = async {
        let mut stream = TcpStream::connect(socks_address).await?;
        socks5_connect(&mut stream, &host, port).await
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Xp2pError::Timeout(format!(
            "SOCKS5 connect to {target} via {socks_address}"
        ))),
    }
}

/// Client half of a no-auth SOCKS5 CONNECT
pub async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Xp2pError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(Xp2pError::ProtocolError(format!(
            "SOCKS5 method rejected: {reply:?}"
        )));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(std::net::IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                Xp2pError::ValidationError(format!("host name too long: {host}"))
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Xp2pError::ProtocolError(format!(
            "SOCKS5 bad version {}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(Xp2pError::ProtocolError(format!(
            "SOCKS5 connect failed with reply code {}",
            head[1]
        )));
    }
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(Xp2pError::ProtocolError(format!(
                "SOCKS5 unknown address type {other}"
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(value: &str) -> Result<(String, u16), Xp2pError> {
    let invalid = || Xp2pError::ValidationError(format!("invalid host:port {value:?}"));
    let (host, port) = value.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
