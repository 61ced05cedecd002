//! Error types for the OpenVPN client.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the OpenVPN client.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid options, detected before connecting
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network read/write failed
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed packet, unexpected message or bad state transition
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Packet bytes are insufficient for the declared layout
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// Opcode outside the known set
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Server rejected our credentials
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// HMAC mismatch, decryption or padding failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Data packet with a non-monotonic packet id
    #[error("Replayed data packet: id {id} <= {last}")]
    Replay { id: u32, last: u32 },

    /// Requested feature the client does not implement
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Internal channel closed unexpectedly
    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new crypto error.
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a new unsupported-feature error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Per-packet errors on the data channel are dropped and logged
    /// instead of killing the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Crypto(_) | Self::Replay { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::crypto("hmac mismatch").is_recoverable());
        assert!(Error::Replay { id: 1, last: 1 }.is_recoverable());
        assert!(!Error::protocol("bad opcode").is_recoverable());
        assert!(!Error::AuthFailed("AUTH_FAILED".into()).is_recoverable());
    }
}
