//! xp2p Library
//!
//! Control plane for bootstrapping xray-core tunnels between a server node
//! and a client node.

pub mod cli;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod netutil;
pub mod storage;
pub mod utils;
