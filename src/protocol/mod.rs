//! OpenVPN wire protocol: packet codec, constants, and the control-channel
//! messages exchanged over the TLS stream.

pub mod constants;
pub mod control;
pub mod packet;

pub use constants::{DATA_V1_KEY0, MAX_PACKET_SIZE, NO_COMPRESSION, PING_PAYLOAD};
pub use control::{
    encode_client_control_message, is_auth_failed, is_control_message, is_push_reply,
    parse_push_reply, parse_server_control_message, PushedOptions, ServerControlMessage,
};
pub use packet::{Opcode, Packet};
