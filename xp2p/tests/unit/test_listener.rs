//! Deploy listener and handshake tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use tokio_test::io::Builder;

use xp2p::deploy::client::{handshake, handshake_over};
use xp2p::deploy::fsm::HandshakeState;
use xp2p::deploy::link::{self, EncryptedLink};
use xp2p::deploy::listener::{DeployListener, Options};
use xp2p::deploy::manifest::Manifest;
use xp2p::deploy::provision::{InstallRequest, LinkRequest, Provisioner, UserRequest};
use xp2p::deploy::session::handle_connection;
use xp2p::errors::Xp2pError;

const TOKEN: &str = "deploy-token";
const USER_LINK: &str =
    "trojan://secret@10.0.10.10:58443?security=tls&sni=10.0.10.10#user@example.invalid";

#[derive(Default)]
struct RecordingProvisioner {
    calls: Mutex<Vec<String>>,
    fail_add_user: bool,
}

impl RecordingProvisioner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn install_engine(&self, request: &InstallRequest) -> Result<(), Xp2pError> {
        self.calls.lock().unwrap().push(format!(
            "install {} {} {} {}",
            request.install_dir, request.config_dir, request.port, request.host
        ));
        Ok(())
    }

    async fn add_user(&self, request: &UserRequest) -> Result<(), Xp2pError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add_user {} {}", request.user_id, request.password));
        if self.fail_add_user {
            return Err(Xp2pError::ProvisionError("user store is read-only".to_string()));
        }
        Ok(())
    }

    async fn build_user_link(&self, request: &LinkRequest) -> Result<String, Xp2pError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("link {} {}", request.host, request.user_id));
        Ok(USER_LINK.to_string())
    }
}

fn manifest(expires_at: i64) -> Manifest {
    Manifest {
        host: "10.0.10.10".to_string(),
        version: 2,
        install_dir: "/opt/xp2p".to_string(),
        trojan_port: "58443".to_string(),
        trojan_user: "user@example.invalid".to_string(),
        trojan_password: "secret".to_string(),
        expires_at,
    }
}

fn sealed(manifest: Manifest) -> EncryptedLink {
    link::build("10.0.10.10", manifest, Duration::from_secs(60))
        .unwrap()
        .1
}

fn options(expected: &EncryptedLink) -> Options {
    Options {
        listen_addr: "127.0.0.1:0".to_string(),
        token: Some(SecretString::from(TOKEN.to_string())),
        expected: Some(link::parse(&expected.link).unwrap()),
        io_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Play the client side by hand and collect every line the server sends
async fn raw_client(stream: DuplexStream, token: &str, ciphertext: &[u8]) -> Vec<String> {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut seen = Vec::new();

    write
        .write_all(format!("AUTH {token}\n").as_bytes())
        .await
        .unwrap();
    match lines.next_line().await.unwrap() {
        Some(line) if line == "OK" => seen.push(line),
        Some(line) => {
            seen.push(line);
            while let Some(line) = lines.next_line().await.unwrap() {
                seen.push(line);
            }
            return seen;
        }
        None => return seen,
    }

    write
        .write_all(format!("MANIFEST-ENC {}\n", ciphertext.len()).as_bytes())
        .await
        .unwrap();
    write.write_all(ciphertext).await.unwrap();
    while let Some(line) = lines.next_line().await.unwrap() {
        seen.push(line);
    }
    seen
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized_and_closes() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();

    // Any further write would fail the mock
    let stream = Builder::new()
        .read(b"AUTH wrong-token\n")
        .write(b"ERR unauthorized\n")
        .build();
    let outcome = handle_connection(stream, &options(&enc), &provisioner).await;

    assert_eq!(outcome.state, HandshakeState::Failure);
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_missing_auth_is_rejected() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();

    let stream = Builder::new()
        .read(b"HELLO\n")
        .write(b"ERR expected AUTH\n")
        .build();
    let outcome = handle_connection(stream, &options(&enc), &provisioner).await;
    assert_eq!(outcome.state, HandshakeState::Failure);
}

#[tokio::test]
async fn test_wrong_ciphertext_is_indistinguishable_from_wrong_token() {
    let enc = sealed(manifest(0));
    let mut other = manifest(0);
    other.trojan_password = "not-the-secret".to_string();
    let foreign = sealed(other);
    let provisioner = RecordingProvisioner::default();
    let options = options(&enc);

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (outcome, seen) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        raw_client(client, TOKEN, &foreign.ciphertext),
    );
    assert_eq!(seen, vec!["OK", "ERR unauthorized"]);
    assert_eq!(outcome.state, HandshakeState::Failure);

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (_, seen) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        raw_client(client, "wrong-token", &enc.ciphertext),
    );
    assert_eq!(seen, vec!["ERR unauthorized"]);
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_expired_manifest_is_rejected() {
    let enc = sealed(manifest(Utc::now().timestamp() - 60));
    let provisioner = RecordingProvisioner::default();
    let options = options(&enc);

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (outcome, seen) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        raw_client(client, TOKEN, &enc.ciphertext),
    );
    assert_eq!(seen, vec!["OK", "ERR link expired"]);
    assert_eq!(outcome.reason.as_deref(), Some("link expired"));
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_pinned_host_mismatch() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();
    let mut options = options(&enc);
    options.host = Some("10.0.10.99".to_string());

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (_, seen) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        raw_client(client, TOKEN, &enc.ciphertext),
    );
    assert_eq!(seen, vec!["OK", "ERR host mismatch"]);
}

#[tokio::test]
async fn test_credential_mismatch_under_expected_link() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();
    let options = options(&enc);

    let mut other_user = enc.manifest.clone();
    other_user.trojan_user = "mallory@example.invalid".to_string();
    let mut other_password = enc.manifest.clone();
    other_password.trojan_password = "not-the-secret".to_string();

    for (forged, reply) in [
        (other_user, "ERR user mismatch"),
        (other_password, "ERR password mismatch"),
    ] {
        let ciphertext = link::encrypt(&enc.link, &forged).unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (outcome, seen) = tokio::join!(
            handle_connection(server, &options, &provisioner),
            raw_client(client, TOKEN, &ciphertext),
        );
        assert_eq!(seen, vec!["OK", reply]);
        assert_eq!(outcome.state, HandshakeState::Failure);
    }
    assert!(provisioner.calls().is_empty());
}

#[tokio::test]
async fn test_unconfigured_listener_rejects_manifest() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();
    let mut options = options(&enc);
    options.expected = None;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (_, seen) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        raw_client(client, TOKEN, &enc.ciphertext),
    );
    assert_eq!(seen, vec!["OK", "ERR deploy link not configured"]);
}

#[tokio::test]
async fn test_oversized_manifest_length_is_rejected() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();

    let stream = Builder::new()
        .read(b"AUTH deploy-token\n")
        .write(b"OK\n")
        .read(b"MANIFEST-ENC 1048577\n")
        .write(b"ERR invalid MANIFEST length\n")
        .build();
    let outcome = handle_connection(stream, &options(&enc), &provisioner).await;
    assert_eq!(outcome.state, HandshakeState::Failure);
}

#[tokio::test]
async fn test_successful_handshake_provisions_and_returns_link() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner::default();
    let options = options(&enc);

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (outcome, result) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        handshake_over(client, TOKEN, &enc.ciphertext, Duration::from_secs(5)),
    );
    let result = result.unwrap();

    assert!(result.success());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.link, USER_LINK);
    assert!(result.out_log.contains("install_dir=/opt/xp2p"));
    assert!(result.out_log.contains("config_dir=config-server"));
    assert!(result.out_log.contains("trojan_port=58443"));
    assert!(result.err_log.is_empty());

    assert!(outcome.is_success());
    assert_eq!(outcome.install_dir.as_deref(), Some("/opt/xp2p"));
    assert_eq!(outcome.link.as_deref(), Some(USER_LINK));
    assert_eq!(
        provisioner.calls(),
        vec![
            "install /opt/xp2p config-server 58443 10.0.10.10",
            "add_user user@example.invalid secret",
            "link 10.0.10.10 user@example.invalid",
        ]
    );
}

#[tokio::test]
async fn test_provisioning_failure_reports_exit_one() {
    let enc = sealed(manifest(0));
    let provisioner = RecordingProvisioner {
        fail_add_user: true,
        ..Default::default()
    };
    let options = options(&enc);

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (outcome, result) = tokio::join!(
        handle_connection(server, &options, &provisioner),
        handshake_over(client, TOKEN, &enc.ciphertext, Duration::from_secs(5)),
    );
    let result = result.unwrap();

    assert_eq!(result.exit_code, 1);
    assert!(result.link.is_empty());
    assert!(result.err_log.contains("user store is read-only"));
    assert!(result.out_log.contains("host=10.0.10.10"));
    assert_eq!(outcome.state, HandshakeState::Failure);

    // Install is idempotent and stays in place
    assert_eq!(provisioner.calls().len(), 2);
    assert!(provisioner.calls()[0].starts_with("install "));
}

#[tokio::test]
async fn test_listener_once_mode_stops_after_handshake() {
    let enc = sealed(manifest(0));
    let listener = DeployListener::bind(options(&enc), Arc::new(RecordingProvisioner::default()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(listener.run(Box::pin(std::future::pending::<()>())));

    let result = handshake(&addr, TOKEN, &enc.ciphertext, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.success());

    let outcome = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let outcome = outcome.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.config_dir.as_deref(), Some("config-server"));
}

#[tokio::test]
async fn test_listener_stops_on_shutdown_signal() {
    let enc = sealed(manifest(0));
    let mut options = options(&enc);
    options.once = false;
    let listener = DeployListener::bind(options, Arc::new(RecordingProvisioner::default()))
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let server = tokio::spawn(listener.run(Box::pin(async move {
        let _ = rx.await;
    })));
    tx.send(()).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn test_listener_stops_when_idle() {
    let enc = sealed(manifest(0));
    let mut options = options(&enc);
    options.idle_timeout = Duration::from_millis(50);
    let listener = DeployListener::bind(options, Arc::new(RecordingProvisioner::default()))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        listener.run(Box::pin(std::future::pending::<()>())),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(outcome.is_none());
}
