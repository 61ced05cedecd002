//! Data channel: the symmetric envelope around tunneled payloads.
//!
//! ## Envelope (non-AEAD)
//!
//! Send: `plaintext = BE32(packet_id) || 0xfa || payload`, PKCS#7 padded and
//! CBC-encrypted under a random IV; the wire frame is
//! `0x30 || hmac(iv || ciphertext) || iv || ciphertext`.
//! Receive reverses the layers, verifying the HMAC in constant time and
//! rejecting non-monotonic packet ids.

use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::Options;
use crate::crypto::{
    fill_random, openvpn_prf, Auth, Cipher, KEY_EXPANSION_LABEL, MASTER_SECRET_LABEL,
};
use crate::error::{Error, Result};
use crate::protocol::{DATA_V1_KEY0, NO_COMPRESSION, PING_PAYLOAD};
use crate::session::Session;

/// The four subkeys derived for one key slot, already truncated to the
/// cipher key length and HMAC output length.
pub struct DataChannelKeys {
    pub(crate) cipher_local: Vec<u8>,
    pub(crate) cipher_remote: Vec<u8>,
    pub(crate) hmac_local: Vec<u8>,
    pub(crate) hmac_remote: Vec<u8>,
}

impl DataChannelKeys {
    /// Run the OpenVPN PRF over the active key slot: master secret from the
    /// pre-master and first seeds, then the 256-byte expansion over the
    /// second seeds and both session ids.
    pub fn derive(session: &Session, cipher: Cipher, auth: Auth) -> Result<Self> {
        let slot = session.active_key()?;
        let local = slot
            .local
            .ok_or_else(|| Error::protocol("local key source missing"))?;
        let remote = slot
            .remote
            .ok_or_else(|| Error::protocol("remote key source not yet exchanged"))?;
        let remote_sid = session
            .remote_session_id()
            .ok_or_else(|| Error::protocol("remote session id not yet known"))?;

        let master = openvpn_prf(
            &local.pre_master,
            MASTER_SECRET_LABEL,
            &local.r1,
            &remote.r1,
            None,
            None,
            48,
        )?;
        let keys = openvpn_prf(
            &master,
            KEY_EXPANSION_LABEL,
            &local.r2,
            &remote.r2,
            Some(session.local_session_id().as_bytes()),
            Some(remote_sid.as_bytes()),
            256,
        )?;

        Ok(Self {
            cipher_local: keys[0..cipher.key_len()].to_vec(),
            hmac_local: keys[64..64 + auth.hash_len()].to_vec(),
            cipher_remote: keys[128..128 + cipher.key_len()].to_vec(),
            hmac_remote: keys[192..192 + auth.hash_len()].to_vec(),
        })
    }
}

/// One direction-pair of the tunnel's encrypted payload path.
///
/// Sends are serialized by the packet-id lock so id assignment and the wire
/// write stay atomic; the receive side keeps its own independent counter.
pub struct DataChannel {
    cipher: Cipher,
    auth: Auth,
    keys: DataChannelKeys,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    local_packet_id: Mutex<u32>,
    remote_packet_id: Mutex<u32>,
}

impl DataChannel {
    /// Bind the data channel to an established session.
    pub fn new(
        session: &Session,
        options: &Options,
        egress: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Arc<Self>> {
        let cipher = options.data_cipher()?;
        if cipher.is_aead() {
            return Err(Error::unsupported("AEAD data channel not implemented"));
        }
        let auth = options.data_auth()?;
        let keys = DataChannelKeys::derive(session, cipher, auth)?;
        debug!(
            "data channel ready: cipher={} auth={}",
            cipher.name(),
            auth.name()
        );
        Ok(Arc::new(Self::from_parts(cipher, auth, keys, egress)))
    }

    fn from_parts(
        cipher: Cipher,
        auth: Auth,
        keys: DataChannelKeys,
        egress: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            cipher,
            auth,
            keys,
            egress,
            local_packet_id: Mutex::new(0),
            remote_packet_id: Mutex::new(0),
        }
    }

    /// Encrypt and transmit one payload.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut pid = self.local_packet_id.lock().unwrap_or_else(|e| e.into_inner());
        *pid += 1;

        let mut plaintext = Vec::with_capacity(5 + payload.len());
        plaintext.extend_from_slice(&pid.to_be_bytes());
        plaintext.push(NO_COMPRESSION);
        plaintext.extend_from_slice(payload);

        let mut iv = vec![0u8; self.cipher.block_size()];
        fill_random(&mut iv);
        let ciphertext = self.cipher.encrypt(&self.keys.cipher_local, &iv, &plaintext)?;
        let mac = self.auth.hmac(&self.keys.hmac_local, &[&iv, &ciphertext])?;

        let mut frame = Vec::with_capacity(1 + mac.len() + iv.len() + ciphertext.len());
        frame.push(DATA_V1_KEY0);
        frame.extend_from_slice(&mac);
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&ciphertext);

        trace!("data send: id={} {} payload bytes", *pid, payload.len());
        self.egress.send(frame).map_err(|_| Error::ChannelClosed)
    }

    /// Verify and decrypt one inbound frame, returning the payload to hand
    /// to the caller, or `None` when the frame was a keepalive we answered.
    pub fn handle_incoming(&self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        if frame.first() != Some(&DATA_V1_KEY0) {
            return Err(Error::protocol(format!(
                "unexpected data frame header: {:#04x}",
                frame.first().copied().unwrap_or(0)
            )));
        }
        let plaintext = self.decrypt(&frame[1..])?;
        if plaintext.len() < 5 {
            return Err(Error::crypto("decrypted data packet too short"));
        }

        let packet_id = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        {
            let mut last = self.remote_packet_id.lock().unwrap_or_else(|e| e.into_inner());
            if packet_id <= *last {
                return Err(Error::Replay {
                    id: packet_id,
                    last: *last,
                });
            }
            *last = packet_id;
        }

        let compression = plaintext[4];
        if compression != NO_COMPRESSION {
            return Err(Error::unsupported(format!(
                "compressed data packet: marker {:#04x}",
                compression
            )));
        }

        let payload = &plaintext[5..];
        if payload == PING_PAYLOAD {
            debug!("openvpn ping, sending reply");
            self.send(&PING_PAYLOAD)?;
            return Ok(None);
        }
        Ok(Some(payload.to_vec()))
    }

    /// Split off MAC and IV, verify the authenticator, then CBC-decrypt.
    fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>> {
        let hash_len = self.auth.hash_len();
        let block_size = self.cipher.block_size();
        if body.len() < hash_len + block_size + block_size {
            return Err(Error::crypto("data packet too short"));
        }
        let mac = &body[..hash_len];
        let iv = &body[hash_len..hash_len + block_size];
        let ciphertext = &body[hash_len + block_size..];

        let expected = self.auth.hmac(&self.keys.hmac_remote, &[iv, ciphertext])?;
        if expected.ct_eq(mac).unwrap_u8() != 1 {
            return Err(Error::crypto("HMAC mismatch"));
        }
        self.cipher.decrypt(&self.keys.cipher_remote, iv, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> DataChannelKeys {
        DataChannelKeys {
            cipher_local: vec![seed; 16],
            cipher_remote: vec![seed ^ 0xff; 16],
            hmac_local: vec![seed.wrapping_add(1); 20],
            hmac_remote: vec![(seed ^ 0xff).wrapping_add(1); 20],
        }
    }

    /// Peer with local/remote key halves swapped, as the server would hold.
    fn mirrored(keys: &DataChannelKeys) -> DataChannelKeys {
        DataChannelKeys {
            cipher_local: keys.cipher_remote.clone(),
            cipher_remote: keys.cipher_local.clone(),
            hmac_local: keys.hmac_remote.clone(),
            hmac_remote: keys.hmac_local.clone(),
        }
    }

    fn pair() -> (
        DataChannel,
        mpsc::UnboundedReceiver<Vec<u8>>,
        DataChannel,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let k = keys(0x42);
        let m = mirrored(&k);
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = DataChannel::from_parts(Cipher::Aes128Cbc, Auth::Sha1, k, tx_a);
        let b = DataChannel::from_parts(Cipher::Aes128Cbc, Auth::Sha1, m, tx_b);
        (a, rx_a, b, rx_b)
    }

    #[tokio::test]
    async fn test_send_receive_roundtrip() {
        let (a, mut rx_a, b, _rx_b) = pair();

        for payload in [&b"ping payload"[..], &[0u8; 0][..], &[7u8; 1400][..]] {
            a.send(payload).unwrap();
            let frame = rx_a.try_recv().unwrap();
            assert_eq!(frame[0], DATA_V1_KEY0);
            let got = b.handle_incoming(&frame).unwrap();
            assert_eq!(got.as_deref(), Some(payload));
        }
    }

    #[tokio::test]
    async fn test_replay_is_rejected() {
        let (a, mut rx_a, b, _rx_b) = pair();

        a.send(b"once").unwrap();
        let frame = rx_a.try_recv().unwrap();
        assert!(b.handle_incoming(&frame).unwrap().is_some());
        // The same ciphertext again must fail with a replay error.
        assert!(matches!(
            b.handle_incoming(&frame),
            Err(Error::Replay { id: 1, last: 1 })
        ));
    }

    #[tokio::test]
    async fn test_packet_ids_strictly_increase() {
        let (a, mut rx_a, b, _rx_b) = pair();

        for _ in 0..3 {
            a.send(b"x").unwrap();
        }
        // Deliver 1, skip 2, deliver 3: accepted; then 2 is a replay.
        let f1 = rx_a.try_recv().unwrap();
        let f2 = rx_a.try_recv().unwrap();
        let f3 = rx_a.try_recv().unwrap();
        assert!(b.handle_incoming(&f1).unwrap().is_some());
        assert!(b.handle_incoming(&f3).unwrap().is_some());
        assert!(matches!(
            b.handle_incoming(&f2),
            Err(Error::Replay { id: 2, last: 3 })
        ));
    }

    #[tokio::test]
    async fn test_hmac_mismatch_is_crypto_error() {
        let (a, mut rx_a, b, _rx_b) = pair();

        a.send(b"tamper me").unwrap();
        let mut frame = rx_a.try_recv().unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(b.handle_incoming(&frame), Err(Error::Crypto(_))));
    }

    #[tokio::test]
    async fn test_wrong_header_is_protocol_error() {
        let (_a, _rx_a, b, _rx_b) = pair();
        assert!(matches!(
            b.handle_incoming(&[0x38, 1, 2, 3]),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_is_answered_not_delivered() {
        let (a, mut rx_a, b, mut rx_b) = pair();

        a.send(&PING_PAYLOAD).unwrap();
        let frame = rx_a.try_recv().unwrap();
        // The keepalive is consumed and a reply goes out on b's egress.
        assert!(b.handle_incoming(&frame).unwrap().is_none());
        let reply = rx_b.try_recv().unwrap();
        // a holds the mirrored keys of b, so a can decrypt b's reply.
        let mirror_of_b = a;
        let decrypted = mirror_of_b.handle_incoming(&reply);
        // a's receive counter is independent of its send counter.
        assert!(decrypted.unwrap().is_none()); // the reply is itself the ping
    }

    #[tokio::test]
    async fn test_derive_truncates_to_cipher_and_hash_lengths() {
        use crate::session::{KeySource, Session, SessionId};
        let session = Session::new();
        session
            .set_remote_session_id(SessionId::from_bytes([5; 8]))
            .unwrap();
        session
            .set_remote_key(KeySource::from_remote([1; 32], [2; 32]))
            .unwrap();

        let keys = DataChannelKeys::derive(&session, Cipher::Aes256Cbc, Auth::Sha256).unwrap();
        assert_eq!(keys.cipher_local.len(), 32);
        assert_eq!(keys.cipher_remote.len(), 32);
        assert_eq!(keys.hmac_local.len(), 32);
        assert_eq!(keys.hmac_remote.len(), 32);
        assert_ne!(keys.cipher_local, keys.cipher_remote);

        let narrow = DataChannelKeys::derive(&session, Cipher::Aes128Cbc, Auth::Sha1).unwrap();
        assert_eq!(narrow.cipher_local.len(), 16);
        assert_eq!(narrow.hmac_local.len(), 20);
        // Truncation of the same expansion: prefixes agree.
        assert_eq!(narrow.cipher_local, keys.cipher_local[..16].to_vec());
    }

    #[tokio::test]
    async fn test_derive_requires_remote_key() {
        use crate::session::{Session, SessionId};
        let session = Session::new();
        session
            .set_remote_session_id(SessionId::from_bytes([5; 8]))
            .unwrap();
        assert!(DataChannelKeys::derive(&session, Cipher::Aes128Cbc, Auth::Sha1).is_err());
    }
}
