//! OpenVPN wire packet codec.
//!
//! ## Binary format (control packets)
//!
//! - byte 0: `(opcode << 3) | key_id`
//! - bytes 1..9: sender's session id
//! - byte 9: ack count N
//! - 4N bytes: big-endian u32 acked packet ids
//! - if N > 0: 8 bytes remote session id
//! - if opcode != P_ACK_V1: 4 bytes big-endian packet id
//! - remainder: payload
//!
//! Data packets carry only the opcode/key-id byte followed by the data
//! channel envelope; session and packet ids live inside that envelope.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::session::SessionId;

/// OpenVPN packet opcodes (the 5 high bits of byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    ControlHardResetClientV1 = 1,
    ControlHardResetServerV1 = 2,
    ControlSoftResetV1 = 3,
    ControlV1 = 4,
    AckV1 = 5,
    DataV1 = 6,
    ControlHardResetClientV2 = 7,
    ControlHardResetServerV2 = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::ControlHardResetClientV1),
            2 => Ok(Self::ControlHardResetServerV1),
            3 => Ok(Self::ControlSoftResetV1),
            4 => Ok(Self::ControlV1),
            5 => Ok(Self::AckV1),
            6 => Ok(Self::DataV1),
            7 => Ok(Self::ControlHardResetClientV2),
            8 => Ok(Self::ControlHardResetServerV2),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

impl Opcode {
    /// Control-channel opcodes, including ACK.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Opcode::ControlHardResetClientV1
                | Opcode::ControlHardResetServerV1
                | Opcode::ControlSoftResetV1
                | Opcode::ControlV1
                | Opcode::AckV1
                | Opcode::ControlHardResetClientV2
                | Opcode::ControlHardResetServerV2
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Opcode::DataV1)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Opcode::AckV1)
    }

    /// Known on the wire but outside the supported handshake: the key
    /// method 1 hard resets and the rekey soft reset. These must never be
    /// dispatched as ordinary control traffic.
    pub fn is_unsupported_reset(&self) -> bool {
        matches!(
            self,
            Opcode::ControlHardResetClientV1
                | Opcode::ControlHardResetServerV1
                | Opcode::ControlSoftResetV1
        )
    }
}

/// A decoded OpenVPN packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub opcode: Opcode,
    pub key_id: u8,
    pub local_session_id: SessionId,
    /// Remote packet ids this packet acknowledges.
    pub acks: Vec<u32>,
    /// Present iff the ack array is non-empty.
    pub remote_session_id: Option<SessionId>,
    /// Present for all non-ACK control packets.
    pub packet_id: Option<u32>,
    pub payload: Bytes,
}

impl Packet {
    /// Build a control packet carrying `payload`.
    pub fn control(
        opcode: Opcode,
        key_id: u8,
        local_session_id: SessionId,
        packet_id: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            opcode,
            key_id,
            local_session_id,
            acks: Vec::new(),
            remote_session_id: None,
            packet_id: Some(packet_id),
            payload,
        }
    }

    /// Build a standalone ACK packet.
    pub fn ack(local_session_id: SessionId, remote_session_id: SessionId, acks: Vec<u32>) -> Self {
        Self {
            opcode: Opcode::AckV1,
            key_id: 0,
            local_session_id,
            acks,
            remote_session_id: Some(remote_session_id),
            packet_id: None,
            payload: Bytes::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.opcode.is_ack()
    }

    pub fn is_data(&self) -> bool {
        self.opcode.is_data()
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.payload.len());
        buf.put_u8(((self.opcode as u8) << 3) | (self.key_id & 0x07));

        if self.opcode.is_data() {
            buf.extend_from_slice(&self.payload);
            return buf.freeze();
        }

        buf.extend_from_slice(self.local_session_id.as_bytes());
        buf.put_u8(self.acks.len() as u8);
        for ack in &self.acks {
            buf.put_u32(*ack);
        }
        if !self.acks.is_empty() {
            let remote = self.remote_session_id.unwrap_or_default();
            buf.extend_from_slice(remote.as_bytes());
        }
        if !self.opcode.is_ack() {
            buf.put_u32(self.packet_id.unwrap_or(0));
        }
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::PacketTooShort(0));
        }
        let opcode = Opcode::try_from(bytes[0] >> 3)?;
        let key_id = bytes[0] & 0x07;

        if opcode.is_data() {
            return Ok(Self {
                opcode,
                key_id,
                local_session_id: SessionId::default(),
                acks: Vec::new(),
                remote_session_id: None,
                packet_id: None,
                payload: Bytes::copy_from_slice(&bytes[1..]),
            });
        }

        let mut buf = &bytes[1..];
        if buf.remaining() < 9 {
            return Err(Error::PacketTooShort(bytes.len()));
        }
        let mut sid = [0u8; 8];
        buf.copy_to_slice(&mut sid);
        let local_session_id = SessionId::from_bytes(sid);

        let ack_count = buf.get_u8() as usize;
        if buf.remaining() < ack_count * 4 {
            return Err(Error::PacketTooShort(bytes.len()));
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(buf.get_u32());
        }

        let remote_session_id = if ack_count > 0 {
            if buf.remaining() < 8 {
                return Err(Error::PacketTooShort(bytes.len()));
            }
            let mut rsid = [0u8; 8];
            buf.copy_to_slice(&mut rsid);
            Some(SessionId::from_bytes(rsid))
        } else {
            None
        };

        let packet_id = if opcode.is_ack() {
            None
        } else {
            if buf.remaining() < 4 {
                return Err(Error::PacketTooShort(bytes.len()));
            }
            Some(buf.get_u32())
        };

        Ok(Self {
            opcode,
            key_id,
            local_session_id,
            acks,
            remote_session_id,
            packet_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
