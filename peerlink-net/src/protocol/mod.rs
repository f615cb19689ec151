//! Wire protocol layer.
//!
//! This module contains:
//! - The header-framed message codec
//! - The SOCKS5 client handshake

pub mod framing;
pub mod socks5;

// Re-export main types
pub use framing::{checksum, command_name, inspect_frame, FrameCodec, FrameStatus, RawMessage, ReadState};
pub use socks5::{handshake, Socks5Command, Socks5Handshake};
