//! Integration tests for xp2p

mod test_fsm;
mod test_listener;
mod test_orchestrator;
