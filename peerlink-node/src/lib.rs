//! Peerlink node library.
//!
//! This library provides the components of the `peerlink-node` binary: CLI
//! parsing, configuration and the peers file, signal handling, and the
//! [`node::PeerBook`] that feeds peers to the connection engine.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
