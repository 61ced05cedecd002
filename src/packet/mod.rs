//! Payload-level packet utilities for tunnel consumers.

pub mod icmp;

pub use icmp::{build_echo_request, internet_checksum, parse_echo_reply, EchoReply};
