//! Error types for xp2p

use thiserror::Error;

use crate::deploy::link::LinkError;
use crate::deploy::manifest::ManifestError;

/// Orchestrator step, used to tell the operator where a deploy stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Validate,
    Prerequisites,
    Executable,
    Upload,
    Provision,
    SaveLink,
    LocalInstall,
    StartRemote,
    StartLocal,
    Connectivity,
}

impl std::fmt::Display for DeployStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validate => write!(f, "validate"),
            Self::Prerequisites => write!(f, "prerequisites"),
            Self::Executable => write!(f, "executable"),
            Self::Upload => write!(f, "upload"),
            Self::Provision => write!(f, "provision"),
            Self::SaveLink => write!(f, "save-link"),
            Self::LocalInstall => write!(f, "local-install"),
            Self::StartRemote => write!(f, "start-remote"),
            Self::StartLocal => write!(f, "start-local"),
            Self::Connectivity => write!(f, "connectivity"),
        }
    }
}

/// Main error type for xp2p
#[derive(Error, Debug)]
pub enum Xp2pError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),

    #[error("Link error: {0}")]
    LinkError(#[from] LinkError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Provisioning error: {0}")]
    ProvisionError(String),

    #[error("Remote command error: {0}")]
    RemoteError(String),

    #[error("Deploy failed at step {step}: {message}")]
    DeployError { step: DeployStep, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Xp2pError {
    /// Tag an error with the orchestrator step that produced it
    pub fn at(step: DeployStep, err: impl std::fmt::Display) -> Self {
        Xp2pError::DeployError {
            step,
            message: err.to_string(),
        }
    }

    /// The failing step, when this error came out of the orchestrator
    pub fn step(&self) -> Option<DeployStep> {
        match self {
            Xp2pError::DeployError { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Xp2pError {
    fn from(err: anyhow::Error) -> Self {
        Xp2pError::Internal(err.to_string())
    }
}
