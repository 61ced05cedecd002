//! Tunnel establishment and payload exchange: the handshake driver and the
//! encrypted data channel it hands over to.

pub mod data;
pub mod handshake;

pub use data::{DataChannel, DataChannelKeys};
pub use handshake::Handshake;
