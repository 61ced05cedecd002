//! OpenVPN client: connects, drives the handshake, and exposes the tunnel.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::net::{reliability::Reliability, tls, transport, ControlStream, TransportReader, TransportWriter};
use crate::protocol::constants::HANDSHAKE_STEP_TIMEOUT;
use crate::protocol::{is_auth_failed, Packet, PushedOptions};
use crate::session::{HandshakeState, Session};
use crate::tunnel::{DataChannel, Handshake};

/// Payloads queued for the consumer before the inbound task backpressures.
const INBOUND_QUEUE: usize = 64;

/// A single OpenVPN connection.
///
/// `run()` performs the whole establishment sequence and returns once the
/// tunnel is usable; payloads then flow through [`Client::send_data`] and
/// the receiver from [`Client::data_channel`].
pub struct Client {
    options: Options,
    session: Arc<Session>,
    state: Arc<Mutex<HandshakeState>>,
    pushed: Option<PushedOptions>,
    data: Option<Arc<DataChannel>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Validate the options and prepare a session.
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            session: Arc::new(Session::new()),
            state: Arc::new(Mutex::new(HandshakeState::Init)),
            pushed: None,
            data: None,
            inbound_rx: None,
            tasks: Vec::new(),
        })
    }

    /// Connect and drive the handshake until the tunnel is ready.
    ///
    /// Any handshake-phase error is fatal: the session transitions to
    /// CLOSED and the error is surfaced to the caller.
    pub async fn run(&mut self) -> Result<()> {
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        if self.state() != HandshakeState::Init {
            return Err(Error::protocol("client already started"));
        }

        let (mut reader, writer) = transport::connect(&self.options).await?;

        // All wire writes funnel through one egress task.
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(egress_loop(writer, egress_rx)));

        let (reliability, delivered_rx) = Reliability::new(self.session.clone(), egress_tx.clone());
        self.tasks
            .push(tokio::spawn(reliability.clone().run_retransmissions()));

        let handshake = Handshake::new(
            self.options.clone(),
            self.session.clone(),
            reliability.clone(),
            self.state.clone(),
        );

        // Hard reset happens on the raw transport; only afterwards does the
        // ingress demultiplexer take the reader over.
        handshake.hard_reset(&mut reader).await?;

        let (data_frames_tx, data_frames_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(demux_loop(
            reader,
            reliability.clone(),
            data_frames_tx,
            self.state.clone(),
        )));

        // TLS handshake over the reliability layer, then key exchange and
        // the pulled tunnel options.
        let control_stream = ControlStream::new(reliability.clone(), delivered_rx);
        let mut tls_stream = timeout(
            HANDSHAKE_STEP_TIMEOUT,
            tls::handshake(&self.options, control_stream),
        )
        .await
        .map_err(|_| Error::Timeout("TLS handshake".into()))??;

        handshake.exchange_keys(&mut tls_stream).await?;
        let pushed = handshake.pull_options(&mut tls_stream).await?;

        let data = DataChannel::new(&self.session, &self.options, egress_tx.clone())?;
        handshake.set_state(HandshakeState::Initialized);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        self.tasks.push(tokio::spawn(data_inbound_loop(
            data.clone(),
            data_frames_rx,
            inbound_tx,
            self.state.clone(),
        )));
        self.tasks
            .push(tokio::spawn(control_monitor_loop(tls_stream, self.state.clone())));

        self.pushed = Some(pushed);
        self.data = Some(data);
        self.inbound_rx = Some(inbound_rx);
        handshake.set_state(HandshakeState::DataReady);
        info!(
            "tunnel established to {}:{}, tunnel ip {}",
            self.options.remote,
            self.options.port,
            self.tunnel_ip().unwrap_or_default()
        );
        Ok(())
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Address assigned to our end of the tunnel, once options were pushed.
    pub fn tunnel_ip(&self) -> Option<String> {
        self.pushed.as_ref().map(|p| p.tunnel_ip.clone())
    }

    /// Every option token the server pushed, opaquely retained.
    pub fn pushed_options(&self) -> Option<&PushedOptions> {
        self.pushed.as_ref()
    }

    /// Encrypt and send one payload. A no-op before the tunnel is ready.
    pub fn send_data(&self, payload: &[u8]) -> Result<()> {
        if self.state() != HandshakeState::DataReady {
            debug!("send_data before DATA_READY, dropping {} bytes", payload.len());
            return Ok(());
        }
        match &self.data {
            Some(data) => data.send(payload),
            None => Ok(()),
        }
    }

    /// Take the inbound tunnel channel; each element is one decrypted
    /// payload. Yields `None` once per client.
    pub fn data_channel(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.take()
    }

    /// Shut the session down: all tasks stop and the transport closes with
    /// them.
    pub fn stop(&mut self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == HandshakeState::Closed {
            return;
        }
        *guard = HandshakeState::Closed;
        drop(guard);
        info!("stopping client");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain queued wire writes onto the transport.
async fn egress_loop(mut writer: TransportWriter, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_packet_bytes(&bytes).await {
            warn!("transport write failed, stopping egress: {}", e);
            break;
        }
    }
}

/// Ingress demultiplexer: control packets feed the reliability layer, data
/// packets bypass it straight to the data channel.
async fn demux_loop(
    mut reader: TransportReader,
    reliability: Arc<Reliability>,
    data_frames: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<HandshakeState>>,
) {
    loop {
        let bytes = match reader.read_packet_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let closed = *state.lock().unwrap_or_else(|g| g.into_inner())
                    == HandshakeState::Closed;
                if !closed {
                    warn!("transport read failed, stopping ingress: {}", e);
                }
                break;
            }
        };
        match Packet::from_bytes(&bytes) {
            Ok(packet) if packet.is_data() => {
                if data_frames.send(bytes).is_err() {
                    break;
                }
            }
            Ok(packet) if packet.opcode.is_unsupported_reset() => {
                let e = Error::protocol("server-initiated soft reset is not supported");
                error!("fatal control error ({:?}): {}", packet.opcode, e);
                *state.lock().unwrap_or_else(|g| g.into_inner()) = HandshakeState::Closed;
                break;
            }
            Ok(packet) => {
                if let Err(e) = reliability.handle_control(packet) {
                    warn!("control packet dropped: {}", e);
                }
            }
            Err(e) => warn!("malformed packet dropped: {}", e),
        }
    }
}

/// Decrypt inbound data frames and deliver payloads to the consumer.
async fn data_inbound_loop(
    data: Arc<DataChannel>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
    state: Arc<Mutex<HandshakeState>>,
) {
    while let Some(frame) = frames.recv().await {
        match data.handle_incoming(&frame) {
            Ok(Some(payload)) => {
                if inbound.send(payload).await.is_err() {
                    debug!("consumer dropped the data channel, stopping");
                    break;
                }
            }
            Ok(None) => {} // keepalive, answered in place
            Err(e) if e.is_recoverable() => warn!("data packet dropped: {}", e),
            Err(e) => {
                error!("fatal data channel error: {}", e);
                *state.lock().unwrap_or_else(|g| g.into_inner()) = HandshakeState::Closed;
                break;
            }
        }
    }
}

/// Keep reading the TLS control stream after establishment; the server may
/// send status text or an AUTH_FAILED there.
async fn control_monitor_loop(
    mut tls_stream: TlsStream<ControlStream>,
    state: Arc<Mutex<HandshakeState>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        match tls_stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = &buf[..n];
                if is_auth_failed(data) {
                    error!("server: {}", String::from_utf8_lossy(data).trim_end_matches('\0'));
                    *state.lock().unwrap_or_else(|g| g.into_inner()) = HandshakeState::Closed;
                    break;
                }
                debug!("control message after establishment ({} bytes)", n);
            }
            Err(e) => {
                debug!("TLS control stream closed: {}", e);
                break;
            }
        }
    }
}
