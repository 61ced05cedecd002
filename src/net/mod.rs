//! Networking: transport adapters, the control-channel reliability layer,
//! and the TLS stream bridged over it.

pub mod reliability;
pub mod tls;
pub mod transport;

pub use reliability::Reliability;
pub use tls::ControlStream;
pub use transport::{TransportReader, TransportWriter};
