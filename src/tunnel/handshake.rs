//! Handshake driver: from hard reset to pushed options.
//!
//! The driver advances the session state machine sequentially. The server's
//! hard reset is consumed straight off the transport before the ingress
//! demultiplexer starts, priming the reliability counter so the TLS-phase
//! control packets are delivered starting at packet id 1.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, timeout_at};
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::net::{ControlStream, Reliability, TransportReader};
use crate::protocol::constants::{HANDSHAKE_STEP_TIMEOUT, PUSH_REQUEST};
use crate::protocol::{
    encode_client_control_message, is_auth_failed, is_control_message, is_push_reply,
    parse_push_reply, parse_server_control_message, Opcode, Packet, PushedOptions,
};
use crate::session::{HandshakeState, Session};

/// Drives the control-channel state machine for one session.
pub struct Handshake {
    options: Options,
    session: Arc<Session>,
    reliability: Arc<Reliability>,
    state: Arc<Mutex<HandshakeState>>,
}

impl Handshake {
    pub fn new(
        options: Options,
        session: Arc<Session>,
        reliability: Arc<Reliability>,
        state: Arc<Mutex<HandshakeState>>,
    ) -> Self {
        Self {
            options,
            session,
            reliability,
            state,
        }
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, next: HandshakeState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!("handshake state: {:?} -> {:?}", *guard, next);
        *guard = next;
    }

    /// Send our hard reset and wait for the server's, learning the remote
    /// session id and acknowledging its packet id.
    pub async fn hard_reset(&self, reader: &mut TransportReader) -> Result<()> {
        let pid = self
            .reliability
            .send_control(Opcode::ControlHardResetClientV2, Bytes::new())?;
        debug!(
            "sent hard reset: session id {}, packet id {}",
            self.session.local_session_id(),
            pid
        );
        self.set_state(HandshakeState::HardResetSent);

        timeout(HANDSHAKE_STEP_TIMEOUT, self.await_server_reset(reader))
            .await
            .map_err(|_| Error::Timeout("waiting for server hard reset".into()))??;
        self.set_state(HandshakeState::ControlChannelOpen);
        Ok(())
    }

    async fn await_server_reset(&self, reader: &mut TransportReader) -> Result<()> {
        loop {
            let bytes = reader.read_packet_bytes().await?;
            let packet = match Packet::from_bytes(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    warn!("dropping malformed packet during reset: {}", e);
                    continue;
                }
            };
            match packet.opcode {
                Opcode::ControlHardResetServerV2 => {
                    let remote = packet.local_session_id;
                    if remote.is_zero() {
                        return Err(Error::protocol("server hard reset with zero session id"));
                    }
                    self.session.set_remote_session_id(remote)?;
                    self.reliability.process_acks(&packet);
                    let server_pid = packet
                        .packet_id
                        .ok_or_else(|| Error::protocol("server hard reset without packet id"))?;
                    debug!("server hard reset: session id {}, packet id {}", remote, server_pid);
                    self.reliability.send_ack(server_pid)?;
                    return Ok(());
                }
                Opcode::AckV1 => self.reliability.process_acks(&packet),
                other => {
                    // The server retransmits anything that matters.
                    warn!("unexpected {:?} before server hard reset, dropping", other);
                }
            }
        }
    }

    /// Send the key method 2 client control message over the TLS stream and
    /// parse the server's mirror, filling the active key slot.
    pub async fn exchange_keys(&self, tls: &mut TlsStream<ControlStream>) -> Result<()> {
        let slot = self.session.active_key()?;
        let local = slot
            .local
            .ok_or_else(|| Error::protocol("local key source missing"))?;
        let message = encode_client_control_message(&local, &self.options)?;
        tls.write_all(&message).await?;
        tls.flush().await?;
        self.set_state(HandshakeState::ControlMessageSent);

        // One deadline for the whole phase; unexpected messages do not
        // extend it.
        let deadline = tokio::time::Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        let mut buf = vec![0u8; 4096];
        loop {
            let n = timeout_at(deadline, tls.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout("waiting for server key exchange".into()))??;
            if n == 0 {
                return Err(Error::protocol("TLS stream closed during key exchange"));
            }
            let data = &buf[..n];
            if is_auth_failed(data) {
                return Err(auth_failed(data));
            }
            if is_control_message(data) {
                let server = parse_server_control_message(data)?;
                debug!("server options: {}", server.options);
                self.session.set_remote_key(server.key)?;
                self.set_state(HandshakeState::KeyExchanged);
                return Ok(());
            }
            warn!("unexpected TLS message during key exchange ({} bytes)", n);
        }
    }

    /// Request and parse the server's pushed options.
    pub async fn pull_options(&self, tls: &mut TlsStream<ControlStream>) -> Result<PushedOptions> {
        tls.write_all(PUSH_REQUEST).await?;
        tls.flush().await?;
        self.set_state(HandshakeState::PullRequestSent);

        let deadline = tokio::time::Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        let mut buf = vec![0u8; 4096];
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for pushed options".into()));
            }
            // The server may not be ready to push yet; repeat the request
            // if it stays quiet.
            let n = match timeout(std::time::Duration::from_secs(5), tls.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    debug!("no push reply yet, repeating request");
                    tls.write_all(PUSH_REQUEST).await?;
                    tls.flush().await?;
                    continue;
                }
                Err(_) => return Err(Error::Timeout("waiting for pushed options".into())),
            };
            if n == 0 {
                return Err(Error::protocol("TLS stream closed awaiting pushed options"));
            }
            let data = &buf[..n];
            if is_auth_failed(data) {
                return Err(auth_failed(data));
            }
            if is_push_reply(data) {
                let pushed = parse_push_reply(data)?;
                info!("server pushed options; tunnel ip {}", pushed.tunnel_ip);
                self.set_state(HandshakeState::OptionsPushed);
                return Ok(pushed);
            }
            warn!("unexpected TLS message awaiting push reply ({} bytes)", n);
        }
    }
}

/// Surface the server's rejection verbatim.
fn auth_failed(data: &[u8]) -> Error {
    let text = String::from_utf8_lossy(data);
    Error::AuthFailed(text.trim_end_matches('\0').to_string())
}
