//! Provisioning collaborators used by the deploy listener
//!
//! The listener only sees the [`Provisioner`] trait. [`StateProvisioner`] is
//! the file-backed implementation the binary ships with: it records the
//! inbound host/port and the trojan users in a private JSON state file
//! under the server's config directory, from which connection links are
//! rendered.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deploy::link::render_trojan_link;
use crate::errors::Xp2pError;
use crate::filesys::file::File;
use crate::storage::layout::config_path;

/// Name of the state file inside `<install_dir>/<config_dir>`
pub const STATE_FILE: &str = "deploy-state.json";

/// Engine installation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub install_dir: String,
    pub config_dir: String,
    pub port: String,
    pub host: String,
}

/// Trojan user to provision
#[derive(Clone, PartialEq, Eq)]
pub struct UserRequest {
    pub install_dir: String,
    pub config_dir: String,
    pub user_id: String,
    pub password: String,
}

impl std::fmt::Debug for UserRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRequest")
            .field("install_dir", &self.install_dir)
            .field("config_dir", &self.config_dir)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Connection link to render for a provisioned user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub install_dir: String,
    pub config_dir: String,
    pub host: String,
    pub user_id: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Install the engine configuration. Must be idempotent.
    async fn install_engine(&self, request: &InstallRequest) -> Result<(), Xp2pError>;

    /// Add or update a trojan user
    async fn add_user(&self, request: &UserRequest) -> Result<(), Xp2pError>;

    /// Render the connection link for a provisioned user
    async fn build_user_link(&self, request: &LinkRequest) -> Result<String, Xp2pError>;
}

/// Provisioned trojan user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanUser {
    pub id: String,
    pub password: String,
}

/// Server-side deploy state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: String,

    #[serde(default)]
    pub users: Vec<TrojanUser>,
}

impl ServerState {
    pub fn find_user(&self, id: &str) -> Option<&TrojanUser> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn upsert_user(&mut self, id: &str, password: &str) {
        match self.users.iter_mut().find(|u| u.id == id) {
            Some(user) => user.password = password.to_string(),
            None => self.users.push(TrojanUser {
                id: id.to_string(),
                password: password.to_string(),
            }),
        }
    }
}

/// File-backed provisioner
#[derive(Debug, Clone, Default)]
pub struct StateProvisioner;

impl StateProvisioner {
    pub fn new() -> Self {
        Self
    }

    /// Location of the state file for an install/config directory pair
    pub fn state_path(install_dir: &str, config_dir: &str) -> PathBuf {
        config_path(install_dir, config_dir).join(STATE_FILE)
    }

    async fn load(&self, file: &File) -> Result<ServerState, Xp2pError> {
        if !file.exists().await {
            return Ok(ServerState::default());
        }
        file.read_json().await
    }
}

#[async_trait]
impl Provisioner for StateProvisioner {
    async fn install_engine(&self, request: &InstallRequest) -> Result<(), Xp2pError> {
        if request.install_dir.trim().is_empty() {
            return Err(Xp2pError::ProvisionError(
                "install directory is not set".to_string(),
            ));
        }
        let file = File::new(Self::state_path(&request.install_dir, &request.config_dir));
        let mut state = self.load(&file).await?;
        state.host = request.host.clone();
        state.port = request.port.clone();
        file.write_json_private(&state).await?;

        info!(
            install_dir = %request.install_dir,
            config_dir = %request.config_dir,
            port = %request.port,
            "Engine configuration installed"
        );
        Ok(())
    }

    async fn add_user(&self, request: &UserRequest) -> Result<(), Xp2pError> {
        let file = File::new(Self::state_path(&request.install_dir, &request.config_dir));
        if !file.exists().await {
            return Err(Xp2pError::ProvisionError(format!(
                "engine is not installed in {}",
                request.install_dir
            )));
        }
        let mut state = self.load(&file).await?;
        state.upsert_user(&request.user_id, &request.password);
        file.write_json_private(&state).await?;

        debug!(user = %request.user_id, "Trojan user provisioned");
        Ok(())
    }

    async fn build_user_link(&self, request: &LinkRequest) -> Result<String, Xp2pError> {
        let file = File::new(Self::state_path(&request.install_dir, &request.config_dir));
        let state = self.load(&file).await?;
        let user = state.find_user(&request.user_id).ok_or_else(|| {
            Xp2pError::ProvisionError(format!("user {} not found", request.user_id))
        })?;
        if state.port.is_empty() {
            return Err(Xp2pError::ProvisionError(
                "trojan port is not configured".to_string(),
            ));
        }
        let host = if request.host.is_empty() {
            state.host.as_str()
        } else {
            request.host.as_str()
        };
        Ok(render_trojan_link(
            &user.password,
            host,
            &state.port,
            &user.id,
            &[],
        ))
    }
}
