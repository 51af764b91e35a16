//! FSM unit tests

use xp2p::deploy::fsm::{HandshakeEvent, HandshakeFsm, HandshakeState};

#[test]
fn test_fsm_initial_state() {
    let fsm = HandshakeFsm::new();
    assert_eq!(fsm.state(), &HandshakeState::AwaitAuth);
    assert!(fsm.reason().is_none());
    assert!(!fsm.state().is_terminal());
}

#[test]
fn test_fsm_handshake_success_flow() {
    let mut fsm = HandshakeFsm::new();

    // AwaitAuth -> Authenticated -> AwaitManifest
    fsm.process(HandshakeEvent::TokenAccepted).unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Authenticated);
    fsm.process(HandshakeEvent::ManifestRequested).unwrap();
    assert_eq!(fsm.state(), &HandshakeState::AwaitManifest);

    // AwaitManifest -> Validated -> Provisioning
    fsm.process(HandshakeEvent::ManifestDecrypted).unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Validated);
    fsm.process(HandshakeEvent::ProvisionStarted).unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Provisioning);

    // Provisioning -> Success
    fsm.process(HandshakeEvent::Provisioned).unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Success);
    assert!(fsm.reason().is_none());
}

#[test]
fn test_fsm_rejection_from_any_open_state() {
    let mut fsm = HandshakeFsm::new();
    fsm.process(HandshakeEvent::Rejected("token rejected".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Failure);
    assert_eq!(fsm.reason(), Some("token rejected"));

    let mut fsm = HandshakeFsm::new();
    fsm.process(HandshakeEvent::TokenAccepted).unwrap();
    fsm.process(HandshakeEvent::ManifestRequested).unwrap();
    fsm.process(HandshakeEvent::ManifestDecrypted).unwrap();
    fsm.process(HandshakeEvent::ProvisionStarted).unwrap();
    fsm.process(HandshakeEvent::Rejected("add user failed".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), &HandshakeState::Failure);
    assert_eq!(fsm.reason(), Some("add user failed"));
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = HandshakeFsm::new();

    // Cannot skip authentication
    assert!(fsm.process(HandshakeEvent::ManifestDecrypted).is_err());
    assert!(fsm.process(HandshakeEvent::Provisioned).is_err());
    assert_eq!(fsm.state(), &HandshakeState::AwaitAuth);

    // Terminal states accept nothing
    fsm.process(HandshakeEvent::Rejected("closed".to_string()))
        .unwrap();
    assert!(fsm.process(HandshakeEvent::TokenAccepted).is_err());
    assert!(fsm
        .process(HandshakeEvent::Rejected("again".to_string()))
        .is_err());
    assert_eq!(fsm.reason(), Some("closed"));
}
