//! OpenVPN protocol constants.

use std::time::Duration;

/// Control channel key method 2 marker byte.
pub const KEY_METHOD: u8 = 0x02;

/// Four zero bytes prefixing every control-channel message on the TLS stream.
pub const CONTROL_MESSAGE_HEADER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Literal pull request sent after key exchange.
pub const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\x00";

/// Prefix of the server's pushed-options reply.
pub const PUSH_REPLY: &[u8] = b"PUSH_REPLY";

/// Prefix of the server's credential rejection.
pub const AUTH_FAILED: &[u8] = b"AUTH_FAILED";

/// Fixed 16-byte in-tunnel keepalive payload (occ ping).
pub const PING_PAYLOAD: [u8; 16] = [
    0x2A, 0x18, 0x7B, 0xF3, 0x64, 0x1E, 0xB4, 0xCB, 0x07, 0xED, 0x2D, 0x0A, 0x98, 0x1F, 0xC7,
    0x48,
];

/// First byte of every data packet: (P_DATA_V1 << 3) | key id 0.
pub const DATA_V1_KEY0: u8 = 0x30;

/// Compression byte marking an uncompressed payload.
pub const NO_COMPRESSION: u8 = 0xfa;

/// Out-of-order control packets buffered before the newest is dropped.
pub const MAX_PENDING_CONTROL: usize = 64;

/// Largest TLS chunk carried in a single control packet, kept safely under
/// the path MTU.
pub const MAX_CONTROL_FRAGMENT: usize = 1024;

/// First retransmission delay for unacknowledged control packets.
pub const RETRANSMIT_INITIAL: Duration = Duration::from_secs(2);

/// Retransmission backoff cap.
pub const RETRANSMIT_MAX: Duration = Duration::from_secs(60);

/// Upper bound on a single handshake phase.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of a buffer that always fits one datagram.
pub const MAX_PACKET_SIZE: usize = 1 << 16;
