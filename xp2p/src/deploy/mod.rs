//! Remote deployment: link codec, deploy listener and client orchestrator

pub mod client;
pub mod fsm;
pub mod link;
pub mod listener;
pub mod local;
pub mod manifest;
pub mod orchestrator;
pub mod provision;
pub mod remote;
pub mod session;
pub mod trojan;
pub mod wire;
