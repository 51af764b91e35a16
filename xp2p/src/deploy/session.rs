//! Server side of one deploy handshake
//!
//! ```text
//! C: AUTH <token>            S: OK | ERR unauthorized
//! C: MANIFEST-ENC <n>\n<n bytes>
//! S: RUN
//! S: EXIT 0|1, [ERR-BEGIN..ERR-END], OUT-BEGIN..OUT-END, [LINK <link>], DONE
//! ```
//!
//! Protocol rejections answer with a single `ERR ...` line and close the
//! connection. A wrong token and a ciphertext that does not open under the
//! expected link both answer `ERR unauthorized`.

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::deploy::fsm::{HandshakeEvent, HandshakeFsm, HandshakeState};
use crate::deploy::listener::Options;
use crate::deploy::manifest::Manifest;
use crate::deploy::provision::{InstallRequest, LinkRequest, Provisioner, UserRequest};
use crate::deploy::wire::{self, LineStream};
use crate::errors::Xp2pError;
use crate::netutil::{canonical_host, validate_host};
use crate::storage::layout::{DEFAULT_SERVER_CONFIG_DIR, DEFAULT_TROJAN_PORT};
use crate::utils::{constant_time_eq, first_non_empty, generate_secret};

/// Result of one handshake
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Terminal handshake state
    pub state: HandshakeState,

    /// Why the handshake failed
    pub reason: Option<String>,

    /// Effective install directory, once resolved
    pub install_dir: Option<String>,

    /// Effective config directory, once resolved
    pub config_dir: Option<String>,

    /// Connection link sent to the peer on success
    pub link: Option<String>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.state == HandshakeState::Success
    }
}

/// Handle one accepted connection to completion
pub async fn handle_connection<S>(
    stream: S,
    options: &Options,
    provisioner: &dyn Provisioner,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = LineStream::new(stream, options.io_timeout);
    let mut session = Session::new(options, provisioner);

    if let Err(e) = session.drive(&mut conn).await {
        debug!("Deploy session aborted: {}", e);
        session.fail(e.to_string());
    }
    let _ = conn.shutdown().await;

    session.into_outcome()
}

struct Session<'a> {
    options: &'a Options,
    provisioner: &'a dyn Provisioner,
    fsm: HandshakeFsm,
    install_dir: Option<String>,
    config_dir: Option<String>,
    link: Option<String>,
}

struct Resolved {
    host: String,
    install_dir: String,
    config_dir: String,
    port: String,
}

impl<'a> Session<'a> {
    fn new(options: &'a Options, provisioner: &'a dyn Provisioner) -> Self {
        Self {
            options,
            provisioner,
            fsm: HandshakeFsm::new(),
            install_dir: None,
            config_dir: None,
            link: None,
        }
    }

    async fn drive<S>(&mut self, conn: &mut LineStream<S>) -> Result<(), Xp2pError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // AwaitAuth
        let Some(line) = conn.read_line().await? else {
            self.fail("connection closed before AUTH");
            return Ok(());
        };
        let Some(token) = parse_auth(&line) else {
            return self.reject(conn, wire::ERR_EXPECTED_AUTH, "expected AUTH").await;
        };
        if !self.token_matches(token) {
            return self.reject(conn, wire::ERR_UNAUTHORIZED, "token rejected").await;
        }
        self.advance(HandshakeEvent::TokenAccepted)?;
        conn.write_line(wire::OK).await?;
        self.advance(HandshakeEvent::ManifestRequested)?;

        // AwaitManifest
        let Some(header) = conn.read_line().await? else {
            self.fail("connection closed before MANIFEST-ENC");
            return Ok(());
        };
        let Some(rest) = header.strip_prefix(wire::MANIFEST_ENC) else {
            return self
                .reject(conn, wire::ERR_EXPECTED_MANIFEST, "expected MANIFEST-ENC")
                .await;
        };
        let len = match parse_length(rest) {
            Some(len) => len,
            None => {
                return self
                    .reject(conn, wire::ERR_INVALID_LENGTH, "invalid manifest length")
                    .await;
            }
        };
        let body = match conn.read_exact(len).await {
            Ok(body) => body,
            Err(e) => {
                let _ = conn.write_line(wire::ERR_READ_BODY).await;
                self.fail(format!("read manifest body: {e}"));
                return Ok(());
            }
        };

        // Validated
        let manifest = match self.open_manifest(&body) {
            Ok(manifest) => manifest,
            Err((line, reason)) => return self.reject(conn, line, &reason).await,
        };
        self.advance(HandshakeEvent::ManifestDecrypted)?;
        info!(host = %manifest.host, version = manifest.version, "Deploy manifest accepted");

        // Provisioning
        let resolved = match self.resolve(&manifest) {
            Ok(resolved) => resolved,
            Err((line, reason)) => return self.reject(conn, line, &reason).await,
        };
        conn.write_line(wire::RUN).await?;
        self.advance(HandshakeEvent::ProvisionStarted)?;
        self.install_dir = Some(resolved.install_dir.clone());
        self.config_dir = Some(resolved.config_dir.clone());

        let logs = vec![
            format!("install_dir={}", resolved.install_dir),
            format!("config_dir={}", resolved.config_dir),
            format!("trojan_port={}", resolved.port),
            format!("host={}", resolved.host),
        ];

        match self.provision(&manifest, &resolved).await {
            Ok(link) => {
                conn.write_line(&format!("{} 0", wire::EXIT)).await?;
                conn.write_segment(wire::OUT_BEGIN, wire::OUT_END, &logs)
                    .await?;
                conn.write_line(&format!("{} {}", wire::LINK, link)).await?;
                conn.write_line(wire::DONE).await?;
                self.link = Some(link);
                self.advance(HandshakeEvent::Provisioned)?;
            }
            Err(e) => {
                warn!("Deploy provisioning failed: {}", e);
                conn.write_line(&format!("{} 1", wire::EXIT)).await?;
                conn.write_segment(wire::ERR_BEGIN, wire::ERR_END, &[e.to_string()])
                    .await?;
                conn.write_segment(wire::OUT_BEGIN, wire::OUT_END, &logs)
                    .await?;
                conn.write_line(wire::DONE).await?;
                self.fail(e.to_string());
            }
        }
        Ok(())
    }

    fn token_matches(&self, supplied: &str) -> bool {
        match &self.options.token {
            Some(expected) if !expected.expose_secret().is_empty() => {
                constant_time_eq(expected.expose_secret().as_bytes(), supplied.as_bytes())
            }
            _ => true,
        }
    }

    /// Decrypt and check the manifest, mapping each rejection to its wire line
    fn open_manifest(&self, body: &[u8]) -> Result<Manifest, (&'static str, String)> {
        let Some(expected) = &self.options.expected else {
            return Err((wire::ERR_NOT_CONFIGURED, "deploy link not configured".to_string()));
        };
        let manifest = expected
            .decrypt(body)
            .map_err(|e| (wire::ERR_UNAUTHORIZED, format!("manifest rejected: {e}")))?;

        if manifest.is_expired_at(Utc::now().timestamp()) {
            return Err((wire::ERR_LINK_EXPIRED, "link expired".to_string()));
        }

        let pinned = self
            .options
            .host
            .as_deref()
            .map(canonical_host)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| expected.host.clone());
        if !pinned.is_empty() && !pinned.eq_ignore_ascii_case(&manifest.host) {
            return Err((
                wire::ERR_HOST_MISMATCH,
                format!("host {} does not match {}", manifest.host, pinned),
            ));
        }

        let want = &expected.manifest;
        if !manifest.trojan_user.is_empty()
            && !want.trojan_user.is_empty()
            && manifest.trojan_user != want.trojan_user
        {
            return Err((wire::ERR_USER_MISMATCH, "user mismatch".to_string()));
        }
        if !manifest.trojan_password.is_empty()
            && !want.trojan_password.is_empty()
            && !constant_time_eq(
                manifest.trojan_password.as_bytes(),
                want.trojan_password.as_bytes(),
            )
        {
            return Err((wire::ERR_PASSWORD_MISMATCH, "password mismatch".to_string()));
        }
        Ok(manifest)
    }

    /// Manifest values win over listener defaults, which win over protocol defaults
    fn resolve(&self, manifest: &Manifest) -> Result<Resolved, (&'static str, String)> {
        let host = first_non_empty(&[
            manifest.host.as_str(),
            self.options.host.as_deref().unwrap_or_default(),
        ]);
        if let Err(e) = validate_host(&host) {
            return Err((wire::ERR_INVALID_HOST, e.to_string()));
        }
        Ok(Resolved {
            host,
            install_dir: first_non_empty(&[
                manifest.install_dir.as_str(),
                self.options.install_dir.as_str(),
            ]),
            config_dir: first_non_empty(&[
                self.options.config_dir.as_str(),
                DEFAULT_SERVER_CONFIG_DIR,
            ]),
            port: first_non_empty(&[
                manifest.trojan_port.as_str(),
                self.options.trojan_port.as_str(),
                DEFAULT_TROJAN_PORT,
            ]),
        })
    }

    async fn provision(&self, manifest: &Manifest, r: &Resolved) -> Result<String, Xp2pError> {
        self.provisioner
            .install_engine(&InstallRequest {
                install_dir: r.install_dir.clone(),
                config_dir: r.config_dir.clone(),
                port: r.port.clone(),
                host: r.host.clone(),
            })
            .await?;

        let user_id = if manifest.trojan_user.is_empty() {
            format!("xp2p-{}@local", Utc::now().timestamp())
        } else {
            manifest.trojan_user.clone()
        };
        let password = if manifest.trojan_password.is_empty() {
            generate_secret(18)
        } else {
            manifest.trojan_password.clone()
        };
        self.provisioner
            .add_user(&UserRequest {
                install_dir: r.install_dir.clone(),
                config_dir: r.config_dir.clone(),
                user_id: user_id.clone(),
                password,
            })
            .await?;

        let link = self
            .provisioner
            .build_user_link(&LinkRequest {
                install_dir: r.install_dir.clone(),
                config_dir: r.config_dir.clone(),
                host: r.host.clone(),
                user_id,
            })
            .await?;
        let link = link.trim().to_string();
        if link.is_empty() {
            return Err(Xp2pError::ProvisionError(
                "failed to build user link".to_string(),
            ));
        }
        Ok(link)
    }

    async fn reject<S>(
        &mut self,
        conn: &mut LineStream<S>,
        line: &str,
        reason: &str,
    ) -> Result<(), Xp2pError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Deploy handshake rejected: {}", reason);
        self.fail(reason);
        conn.write_line(line).await
    }

    fn advance(&mut self, event: HandshakeEvent) -> Result<(), Xp2pError> {
        self.fsm.process(event).map_err(Xp2pError::ProtocolError)
    }

    fn fail(&mut self, reason: impl Into<String>) {
        if !self.fsm.state().is_terminal() {
            let _ = self.fsm.process(HandshakeEvent::Rejected(reason.into()));
        }
    }

    fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            state: self.fsm.state().clone(),
            reason: self.fsm.reason().map(str::to_string),
            install_dir: self.install_dir,
            config_dir: self.config_dir,
            link: self.link,
        }
    }
}

/// Token of an `AUTH` line; `AUTH` alone carries an empty token
fn parse_auth(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(wire::AUTH)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix(' ').map(str::trim)
}

/// Length of a `MANIFEST-ENC` header, within `[0, MAX_MANIFEST_LEN]`
fn parse_length(rest: &str) -> Option<usize> {
    let value = rest.strip_prefix(' ')?.trim();
    match value.parse::<usize>() {
        Ok(n) if n <= wire::MAX_MANIFEST_LEN => Some(n),
        _ => None,
    }
}
