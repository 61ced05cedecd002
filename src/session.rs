//! Session state shared by the control and data channels.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{fill_random, random_bytes};
use crate::error::{Error, Result};

/// 8-byte random identifier each peer assigns at connection start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionId([u8; 8]);

impl SessionId {
    /// Create a fresh random session id.
    pub fn random() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = slice
            .try_into()
            .map_err(|_| Error::protocol("session id must be 8 bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Zero-valued until the remote's hard reset is received.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Per-side key exchange material for key method 2.
///
/// The pre-master is only meaningful on the client side; the server's
/// control message carries just the two random seeds.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySource {
    pub pre_master: [u8; 48],
    pub r1: [u8; 32],
    pub r2: [u8; 32],
}

impl KeySource {
    /// Create a fresh local key source with random material.
    pub fn random() -> Self {
        let mut ks = Self {
            pre_master: [0u8; 48],
            r1: [0u8; 32],
            r2: [0u8; 32],
        };
        fill_random(&mut ks.pre_master);
        fill_random(&mut ks.r1);
        fill_random(&mut ks.r2);
        ks
    }

    /// Build a remote key source from parsed seeds (no pre-master).
    pub fn from_remote(r1: [u8; 32], r2: [u8; 32]) -> Self {
        Self {
            pre_master: [0u8; 48],
            r1,
            r2,
        }
    }
}

impl fmt::Debug for KeySource {
    // key material stays out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySource").finish_non_exhaustive()
    }
}

/// A key slot: local and remote key sources for one data-channel key id.
#[derive(Debug, Clone, Default)]
pub struct DataChannelKey {
    pub local: Option<KeySource>,
    pub remote: Option<KeySource>,
}

impl DataChannelKey {
    pub fn is_complete(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }
}

/// Handshake progress, from connection start to tunnel availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Init,
    HardResetSent,
    ControlChannelOpen,
    ControlMessageSent,
    KeyExchanged,
    PullRequestSent,
    OptionsPushed,
    Initialized,
    DataReady,
    Closed,
}

/// Shared session state.
///
/// The control packet id counter is a single atomic so outbound ids are
/// monotonic across the session; everything else sits behind mutexes and
/// is written from the handshake driver only.
pub struct Session {
    local_session_id: SessionId,
    remote_session_id: Mutex<Option<SessionId>>,
    keys: Mutex<Vec<DataChannelKey>>,
    active_key_id: u8,
    local_packet_id: AtomicU32,
    last_inbound_acked: Mutex<Option<u32>>,
}

impl Session {
    /// Initialize a session ready to be used: key slot 0 gets a fresh local
    /// key source, and the local session id is random.
    pub fn new() -> Self {
        let key0 = DataChannelKey {
            local: Some(KeySource::random()),
            remote: None,
        };
        Self {
            local_session_id: SessionId::random(),
            remote_session_id: Mutex::new(None),
            keys: Mutex::new(vec![key0]),
            active_key_id: 0,
            local_packet_id: AtomicU32::new(0),
            last_inbound_acked: Mutex::new(None),
        }
    }

    pub fn local_session_id(&self) -> SessionId {
        self.local_session_id
    }

    /// Remote session id, once learned from the server's hard reset.
    pub fn remote_session_id(&self) -> Option<SessionId> {
        *self.remote_session_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the remote session id. Fixed after the first hard reset;
    /// a differing value afterwards is a protocol error.
    pub fn set_remote_session_id(&self, sid: SessionId) -> Result<()> {
        let mut guard = self.remote_session_id.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            None => {
                *guard = Some(sid);
                Ok(())
            }
            Some(existing) if existing == sid => Ok(()),
            Some(_) => Err(Error::protocol("remote session id changed mid-session")),
        }
    }

    /// The data-channel key id in use.
    pub fn active_key_id(&self) -> u8 {
        self.active_key_id
    }

    /// Copy of the active key slot.
    pub fn active_key(&self) -> Result<DataChannelKey> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(self.active_key_id as usize)
            .cloned()
            .ok_or_else(|| Error::protocol("no such key id"))
    }

    /// Fill in the remote key source for the active slot after the server's
    /// control message is parsed.
    pub fn set_remote_key(&self, remote: KeySource) -> Result<()> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let slot = keys
            .get_mut(self.active_key_id as usize)
            .ok_or_else(|| Error::protocol("no such key id"))?;
        slot.remote = Some(remote);
        Ok(())
    }

    /// Return a unique control packet id, post-incrementing the counter.
    pub fn next_packet_id(&self) -> u32 {
        self.local_packet_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest inbound control packet id we have acknowledged.
    pub fn last_inbound_acked(&self) -> Option<u32> {
        *self.last_inbound_acked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an acknowledged inbound id; never regresses.
    pub fn record_inbound_acked(&self, pid: u32) {
        let mut guard = self.last_inbound_acked.lock().unwrap_or_else(|e| e.into_inner());
        if guard.map_or(true, |last| pid > last) {
            *guard = Some(pid);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_local_key() {
        let s = Session::new();
        assert!(!s.local_session_id().is_zero());
        assert!(s.remote_session_id().is_none());
        let key = s.active_key().unwrap();
        assert!(key.local.is_some());
        assert!(key.remote.is_none());
    }

    #[test]
    fn test_packet_id_monotonic_from_zero() {
        let s = Session::new();
        assert_eq!(s.next_packet_id(), 0); // hard reset
        assert_eq!(s.next_packet_id(), 1); // first P_CONTROL_V1
        assert_eq!(s.next_packet_id(), 2);
    }

    #[test]
    fn test_remote_session_id_fixed_once_set() {
        let s = Session::new();
        let a = SessionId::from_bytes([1; 8]);
        let b = SessionId::from_bytes([2; 8]);
        s.set_remote_session_id(a).unwrap();
        assert!(s.set_remote_session_id(a).is_ok());
        assert!(s.set_remote_session_id(b).is_err());
        assert_eq!(s.remote_session_id(), Some(a));
    }

    #[test]
    fn test_inbound_acked_never_regresses() {
        let s = Session::new();
        assert_eq!(s.last_inbound_acked(), None);
        s.record_inbound_acked(0);
        assert_eq!(s.last_inbound_acked(), Some(0));
        s.record_inbound_acked(3);
        s.record_inbound_acked(1); // duplicate re-ack
        assert_eq!(s.last_inbound_acked(), Some(3));
    }

    #[test]
    fn test_remote_key_fills_active_slot() {
        let s = Session::new();
        assert!(!s.active_key().unwrap().is_complete());
        s.set_remote_key(KeySource::from_remote([1; 32], [2; 32])).unwrap();
        assert!(s.active_key().unwrap().is_complete());
    }

    #[test]
    fn test_session_id_display() {
        let sid = SessionId::from_bytes([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert_eq!(sid.to_string(), "deadbeef00010203");
    }
}
