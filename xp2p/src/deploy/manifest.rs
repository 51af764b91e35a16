//! Deployment manifest
//!
//! A manifest describes one deployment: the public host of the server node,
//! the schema version, where to install, and the trojan credentials the
//! server should provision. It is normalized and validated before every
//! serialization and after every deserialization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::netutil::{canonical_host, validate_host, HostError};

/// Current manifest schema version
pub const CURRENT_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("deployment manifest requires host")]
    HostEmpty,

    #[error("deployment manifest host is invalid: {0}")]
    HostInvalid(HostError),

    #[error("deployment manifest version must be positive")]
    VersionInvalid,

    #[error("deployment manifest user and password must both be set or both be empty")]
    CredentialPair,

    #[error("decode deployment manifest: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Deployment manifest
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Public host of the server node (IP literal or DNS name)
    pub host: String,

    /// Schema version
    #[serde(default)]
    pub version: u32,

    /// Remote installation directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_dir: String,

    /// Trojan inbound port, as a numeric string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trojan_port: String,

    /// Trojan user identifier
    #[serde(default, rename = "user", skip_serializing_if = "String::is_empty")]
    pub trojan_user: String,

    /// Trojan user password
    #[serde(default, rename = "password", skip_serializing_if = "String::is_empty")]
    pub trojan_password: String,

    /// Expiry as unix seconds, 0 when not set
    #[serde(default)]
    pub expires_at: i64,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let password = if self.trojan_password.is_empty() {
            ""
        } else {
            "***"
        };
        f.debug_struct("Manifest")
            .field("host", &self.host)
            .field("version", &self.version)
            .field("install_dir", &self.install_dir)
            .field("trojan_port", &self.trojan_port)
            .field("trojan_user", &self.trojan_user)
            .field("trojan_password", &password)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Manifest {
    /// Trim all string fields, write IP hosts in standard form and default the version
    pub fn normalize(mut self) -> Self {
        self.host = canonical_host(&self.host);
        self.install_dir = self.install_dir.trim().to_string();
        self.trojan_port = self.trojan_port.trim().to_string();
        self.trojan_user = self.trojan_user.trim().to_string();
        self.trojan_password = self.trojan_password.trim().to_string();
        if self.version == 0 {
            self.version = CURRENT_VERSION;
        }
        self
    }

    /// Check the manifest invariants
    pub fn validate(&self) -> Result<(), ManifestError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ManifestError::HostEmpty);
        }
        validate_host(host).map_err(ManifestError::HostInvalid)?;

        if self.version == 0 {
            return Err(ManifestError::VersionInvalid);
        }

        let user_present = !self.trojan_user.trim().is_empty();
        let password_present = !self.trojan_password.trim().is_empty();
        if user_present != password_present {
            return Err(ManifestError::CredentialPair);
        }
        Ok(())
    }

    /// Encode as compact JSON. Never emits bytes for an invalid manifest.
    pub fn marshal(&self) -> Result<Vec<u8>, ManifestError> {
        let normalized = self.clone().normalize();
        normalized.validate()?;
        Ok(serde_json::to_vec(&normalized)?)
    }

    /// Decode, normalize and validate
    pub fn unmarshal(data: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        let manifest = manifest.normalize();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Whether both trojan credentials are present
    pub fn has_credentials(&self) -> bool {
        !self.trojan_user.is_empty() && !self.trojan_password.is_empty()
    }

    /// Whether the manifest carries an expiry that lies before `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at > 0 && now > self.expires_at
    }
}
