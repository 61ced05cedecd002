//! Minimal OpenVPN client library.
//!
//! Implements the OpenVPN wire protocol in TLS mode over UDP with a
//! non-AEAD data channel: the control channel with its reliability and ACK
//! layer, the TLS handshake tunneled over it, key method 2 derivation, and
//! the CBC/HMAC data envelope with replay protection.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod tunnel;

// Re-export main types
pub use client::Client;
pub use config::{Options, Proto};
pub use error::{Error, Result};
pub use session::HandshakeState;

/// Default configuration file path for the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
