//! Finite State Machine for one deploy handshake

use serde::{Deserialize, Serialize};

/// Handshake state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    /// Waiting for `AUTH <token>`
    AwaitAuth,

    /// Token accepted, `OK` sent
    Authenticated,

    /// Waiting for the `MANIFEST-ENC` header and body
    AwaitManifest,

    /// Manifest decrypted and checked
    Validated,

    /// `RUN` sent, provisioning collaborators running
    Provisioning,

    /// `EXIT 0` sent
    Success,

    /// Rejected or provisioning failed
    Failure,
}

impl HandshakeState {
    /// Whether the connection must close after this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Success | HandshakeState::Failure)
    }
}

/// Handshake event
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// The peer presented an acceptable token
    TokenAccepted,

    /// Ready to read the manifest
    ManifestRequested,

    /// Manifest opened and passed expiry/host/credential checks
    ManifestDecrypted,

    /// Provisioning started
    ProvisionStarted,

    /// Provisioning finished successfully
    Provisioned,

    /// Any rejection or failure
    Rejected(String),
}

/// Handshake FSM
#[derive(Debug, Clone)]
pub struct HandshakeFsm {
    state: HandshakeState,
    reason: Option<String>,
}

impl HandshakeFsm {
    /// Create a new FSM awaiting authentication
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitAuth,
            reason: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Failure reason, if the handshake failed
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: HandshakeEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (state, HandshakeEvent::Rejected(reason)) if !state.is_terminal() => {
                self.reason = Some(reason.clone());
                HandshakeState::Failure
            }
            (HandshakeState::AwaitAuth, HandshakeEvent::TokenAccepted) => {
                HandshakeState::Authenticated
            }
            (HandshakeState::Authenticated, HandshakeEvent::ManifestRequested) => {
                HandshakeState::AwaitManifest
            }
            (HandshakeState::AwaitManifest, HandshakeEvent::ManifestDecrypted) => {
                HandshakeState::Validated
            }
            (HandshakeState::Validated, HandshakeEvent::ProvisionStarted) => {
                HandshakeState::Provisioning
            }
            (HandshakeState::Provisioning, HandshakeEvent::Provisioned) => HandshakeState::Success,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for HandshakeFsm {
    fn default() -> Self {
        Self::new()
    }
}
