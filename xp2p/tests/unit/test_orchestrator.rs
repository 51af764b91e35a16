//! Client deploy orchestrator tests

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use xp2p::deploy::link;
use xp2p::deploy::listener::{self, DeployListener};
use xp2p::deploy::local::{ClientState, LocalRuntime};
use xp2p::deploy::orchestrator::{ensure_remote_binary, Options, Orchestrator};
use xp2p::deploy::provision::{InstallRequest, LinkRequest, Provisioner, UserRequest};
use xp2p::deploy::remote::{ExecOutput, ForwardGuard, RemoteExec, SshTarget};
use xp2p::errors::{DeployStep, Xp2pError};
use xp2p::filesys::dir::Dir;
use xp2p::storage::settings::Settings;
use xp2p::utils::sha256_hash;

const SERVER_LINK: &str =
    "trojan://pw-secret@127.0.0.1:58443?security=tls&sni=127.0.0.1#alice@local";

type Journal = Arc<Mutex<Vec<String>>>;

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

fn no_shutdown() -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(std::future::pending::<()>())
}

/// Server-side collaborators behind the in-process listener
struct FixedProvisioner {
    fail_install: bool,
}

#[async_trait]
impl Provisioner for FixedProvisioner {
    async fn install_engine(&self, _request: &InstallRequest) -> Result<(), Xp2pError> {
        if self.fail_install {
            return Err(Xp2pError::ProvisionError("disk full".to_string()));
        }
        Ok(())
    }

    async fn add_user(&self, _request: &UserRequest) -> Result<(), Xp2pError> {
        Ok(())
    }

    async fn build_user_link(&self, _request: &LinkRequest) -> Result<String, Xp2pError> {
        Ok(SERVER_LINK.to_string())
    }
}

/// Remote host double; `server deploy` starts a real listener on loopback
#[derive(Default)]
struct MockRemote {
    journal: Journal,
    remote_hash: Option<String>,
    fail_server_run: bool,
    fail_install: bool,

    /// Accept one connection, read AUTH and hang up before the real listener binds
    drop_first_connection: bool,
}

fn quoted_flag(command: &str, key: &str) -> Option<String> {
    let prefix = format!("--{key}=");
    command
        .split_whitespace()
        .map(|word| word.trim_matches('\''))
        .find_map(|word| word.strip_prefix(&prefix).map(str::to_string))
}

fn exec_ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

impl MockRemote {
    fn record(&self, entry: &str) {
        self.journal.lock().unwrap().push(entry.to_string());
    }

    async fn start_listener(&self, command: &str) -> Result<(), Xp2pError> {
        let listen = quoted_flag(command, "listen").unwrap_or_default();
        let port = listen.rsplit(':').next().unwrap_or_default();
        let options = listener::Options {
            listen_addr: format!("127.0.0.1:{port}"),
            token: quoted_flag(command, "token").map(SecretString::from),
            expected: Some(link::parse(&quoted_flag(command, "link").unwrap_or_default())?),
            once: command.contains("--once"),
            io_timeout: Duration::from_secs(5),
            config_dir: quoted_flag(command, "config-dir").unwrap_or_default(),
            ..Default::default()
        };
        let provisioner = Arc::new(FixedProvisioner {
            fail_install: self.fail_install,
        });

        if self.drop_first_connection {
            let early = TcpListener::bind(&options.listen_addr).await?;
            let journal = self.journal.clone();
            tokio::spawn(async move {
                let (stream, _) = early.accept().await.unwrap();
                let mut auth = String::new();
                BufReader::new(stream).read_line(&mut auth).await.unwrap();
                journal.lock().unwrap().push("hang up".to_string());
                drop(early);
                let listener = DeployListener::bind(options, provisioner).await.unwrap();
                listener.run(no_shutdown()).await.unwrap();
            });
            return Ok(());
        }

        let listener = DeployListener::bind(options, provisioner).await?;
        tokio::spawn(listener.run(no_shutdown()));
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    async fn check_prerequisites(&self) -> Result<(), Xp2pError> {
        Ok(())
    }

    async fn exec(&self, _target: &SshTarget, command: &str) -> Result<ExecOutput, Xp2pError> {
        if command.starts_with("sha256sum") {
            self.record("sha256sum");
            return Ok(match &self.remote_hash {
                Some(hash) => exec_ok(&format!("{hash}  xp2p/xp2p\n")),
                None => ExecOutput {
                    status: 1,
                    ..exec_ok("")
                },
            });
        }
        if command.contains(" server deploy ") {
            self.record("server deploy");
            self.start_listener(command).await?;
            return Ok(exec_ok(""));
        }
        if command.contains(" server run ") {
            self.record("server run");
            if self.fail_server_run {
                return Ok(ExecOutput {
                    status: 127,
                    stdout: String::new(),
                    stderr: "xp2p: not found".to_string(),
                });
            }
            return Ok(exec_ok(""));
        }
        let verb = command.split_whitespace().next().unwrap_or_default();
        self.record(verb);
        Ok(exec_ok(""))
    }

    async fn copy(&self, _target: &SshTarget, _local: &Path, remote: &str) -> Result<(), Xp2pError> {
        self.record(&format!("copy {remote}"));
        Ok(())
    }

    async fn forward(
        &self,
        _target: &SshTarget,
        _local_port: u16,
        _remote_port: u16,
    ) -> Result<ForwardGuard, Xp2pError> {
        self.record("forward");
        Ok(ForwardGuard::detached())
    }
}

/// Local host double; processes are plain ids
struct MockLocal {
    journal: Journal,
    executable: PathBuf,
    ping_ok: bool,
    installed: Arc<Mutex<Option<ClientState>>>,

    /// When set, ping signals it and never returns
    ping_stalls: Option<Arc<Notify>>,
}

#[async_trait]
impl LocalRuntime for MockLocal {
    type Process = u32;

    fn executable(&self) -> Result<PathBuf, Xp2pError> {
        Ok(self.executable.clone())
    }

    async fn install_client(
        &self,
        _install_dir: &Path,
        _config_dir: &str,
        state: &ClientState,
    ) -> Result<(), Xp2pError> {
        self.journal.lock().unwrap().push("install".to_string());
        *self.installed.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn start_client(&self, _install_dir: &Path, _config_dir: &str) -> Result<u32, Xp2pError> {
        self.journal.lock().unwrap().push("start".to_string());
        Ok(7)
    }

    async fn stop_client(&self, process: u32) {
        self.journal.lock().unwrap().push(format!("stop {process}"));
    }

    fn release_client(&self, process: u32) {
        self.journal.lock().unwrap().push(format!("release {process}"));
    }

    async fn ping(
        &self,
        _socks_address: &str,
        target: &str,
        _timeout: Duration,
    ) -> Result<Duration, Xp2pError> {
        self.journal.lock().unwrap().push(format!("ping {target}"));
        if let Some(stalled) = &self.ping_stalls {
            stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if self.ping_ok {
            Ok(Duration::from_millis(5))
        } else {
            Err(Xp2pError::Timeout("socks5 connect".to_string()))
        }
    }

    async fn sleep(&self, _duration: Duration) {}
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Fixture {
    journal: Journal,
    workdir: Dir,
    executable: PathBuf,
}

impl Fixture {
    async fn new() -> Self {
        let workdir = Dir::create_temp_dir("xp2p-orchestrator").await.unwrap();
        let executable = workdir.path().join("xp2p");
        workdir
            .file("xp2p")
            .write_bytes(b"#!/bin/sh\necho xp2p\n")
            .await
            .unwrap();
        Self {
            journal: Journal::default(),
            workdir,
            executable,
        }
    }

    async fn options(&self, extra: &[(&str, &str)]) -> Options {
        let port = free_port().await.to_string();
        let install_dir = self.workdir.path().to_string_lossy().into_owned();
        let mut flags: HashMap<String, String> = [
            ("remote-host", "127.0.0.1"),
            ("user", "alice@local"),
            ("password", "pw-secret"),
            ("deploy-port", port.as_str()),
            ("install-dir", install_dir.as_str()),
            ("handshake-timeout", "10"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            flags.insert(k.to_string(), v.to_string());
        }
        Options::resolve(&Settings::default(), &flags).unwrap()
    }

    fn remote(&self) -> MockRemote {
        MockRemote {
            journal: self.journal.clone(),
            ..Default::default()
        }
    }

    fn local(&self, ping_ok: bool) -> MockLocal {
        MockLocal {
            journal: self.journal.clone(),
            executable: self.executable.clone(),
            ping_ok,
            installed: Arc::default(),
            ping_stalls: None,
        }
    }

    async fn cleanup(self) {
        let _ = self.workdir.delete().await;
    }
}

#[tokio::test]
async fn test_deploy_success_flow() {
    let fixture = Fixture::new().await;
    let saved = fixture.workdir.path().join("link.txt");
    let options = fixture
        .options(&[("save-link", saved.to_string_lossy().as_ref())])
        .await;

    let orchestrator = Orchestrator::new(options, fixture.remote(), fixture.local(true));
    let report = orchestrator.run(no_shutdown()).await.unwrap();

    assert_eq!(report.link, SERVER_LINK);
    assert!(report.uploaded);
    assert_eq!(report.ping, Duration::from_millis(5));
    assert_eq!(
        entries(&fixture.journal),
        vec![
            "sha256sum",
            "mkdir",
            "copy xp2p/xp2p",
            "chmod",
            "server deploy",
            "install",
            "server run",
            "start",
            "ping 127.0.0.1:58443",
            "release 7",
        ]
    );

    let saved_link = tokio::fs::read_to_string(&saved).await.unwrap();
    assert_eq!(saved_link.trim(), SERVER_LINK);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_local_client_state_comes_from_server_link() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[("socks-address", "127.0.0.1:1080")]).await;
    let local = fixture.local(true);
    let installed = local.installed.clone();

    let orchestrator = Orchestrator::new(options, fixture.remote(), local);
    orchestrator.run(no_shutdown()).await.unwrap();

    let state = installed.lock().unwrap().clone().unwrap();
    assert_eq!(state.server_address, "127.0.0.1");
    assert_eq!(state.server_port, 58443);
    assert_eq!(state.user, "alice@local");
    assert_eq!(state.password, "pw-secret");
    assert_eq!(state.server_name.as_deref(), Some("127.0.0.1"));
    assert_eq!(state.socks_address, "127.0.0.1:1080");

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_failed_ping_rolls_back_local_then_remote() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[]).await;

    let orchestrator = Orchestrator::new(options, fixture.remote(), fixture.local(false));
    let err = orchestrator.run(no_shutdown()).await.unwrap_err();

    assert_eq!(err.step(), Some(DeployStep::Connectivity));
    let journal = entries(&fixture.journal);
    assert_eq!(
        &journal[journal.len() - 5..],
        &["server run", "start", "ping 127.0.0.1:58443", "stop 7", "pkill"]
    );
    assert!(!journal.iter().any(|e| e.starts_with("release")));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_failed_remote_start_rolls_back_nothing_else() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[]).await;
    let remote = MockRemote {
        fail_server_run: true,
        ..fixture.remote()
    };

    let orchestrator = Orchestrator::new(options, remote, fixture.local(true));
    let err = orchestrator.run(no_shutdown()).await.unwrap_err();

    assert_eq!(err.step(), Some(DeployStep::StartRemote));
    assert!(err.to_string().contains("xp2p: not found"));
    let journal = entries(&fixture.journal);
    assert_eq!(journal.last().map(String::as_str), Some("server run"));
    assert!(!journal.iter().any(|e| e == "pkill" || e.starts_with("stop")));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_server_install_failure_stops_before_local_install() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[]).await;
    let remote = MockRemote {
        fail_install: true,
        ..fixture.remote()
    };

    let orchestrator = Orchestrator::new(options, remote, fixture.local(true));
    let err = orchestrator.run(no_shutdown()).await.unwrap_err();

    assert_eq!(err.step(), Some(DeployStep::Provision));
    assert!(err.to_string().contains("disk full"));
    assert!(!entries(&fixture.journal).iter().any(|e| e == "install"));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_ensure_remote_binary_skips_matching_hash() {
    let fixture = Fixture::new().await;
    let hash = sha256_hash(b"#!/bin/sh\necho xp2p\n");
    let remote = MockRemote {
        remote_hash: Some(hash.to_uppercase()),
        ..fixture.remote()
    };
    let target = SshTarget {
        user: "root".to_string(),
        host: "127.0.0.1".to_string(),
        port: 22,
    };

    let uploaded = ensure_remote_binary(&remote, &target, &fixture.executable, "xp2p/xp2p")
        .await
        .unwrap();
    assert!(!uploaded);
    assert_eq!(entries(&fixture.journal), vec!["sha256sum"]);

    let remote = MockRemote {
        remote_hash: Some("0".repeat(64)),
        ..fixture.remote()
    };
    let uploaded = ensure_remote_binary(&remote, &target, &fixture.executable, "xp2p/xp2p")
        .await
        .unwrap();
    assert!(uploaded);
    assert!(entries(&fixture.journal).contains(&"copy xp2p/xp2p".to_string()));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_handshake_retries_after_connection_closed_without_reply() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[]).await;
    let remote = MockRemote {
        drop_first_connection: true,
        ..fixture.remote()
    };

    let orchestrator = Orchestrator::new(options, remote, fixture.local(true));
    let report = orchestrator.run(no_shutdown()).await.unwrap();

    assert_eq!(report.link, SERVER_LINK);
    let journal = entries(&fixture.journal);
    let hang_up = journal.iter().position(|e| e == "hang up").unwrap();
    let install = journal.iter().position(|e| e == "install").unwrap();
    assert!(hang_up < install);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_interrupt_after_start_rolls_back() {
    let fixture = Fixture::new().await;
    let options = fixture.options(&[]).await;
    let stalled = Arc::new(Notify::new());
    let local = MockLocal {
        ping_stalls: Some(stalled.clone()),
        ..fixture.local(true)
    };

    let orchestrator = Orchestrator::new(options, fixture.remote(), local);
    let err = orchestrator
        .run(Box::pin(async move { stalled.notified().await }))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("interrupted"));
    let journal = entries(&fixture.journal);
    assert_eq!(
        &journal[journal.len() - 5..],
        &["server run", "start", "ping 127.0.0.1:58443", "stop 7", "pkill"]
    );
    assert!(!journal.iter().any(|e| e.starts_with("release")));

    fixture.cleanup().await;
}
