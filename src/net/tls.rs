//! TLS over the control channel.
//!
//! The OpenVPN control channel carries a standard TLS session once the
//! hard-reset exchange is done. [`ControlStream`] presents the reliability
//! layer as a bidirectional byte stream so `tokio-rustls` can run the
//! handshake and the encrypted control message exchange over it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::net::reliability::Reliability;
use crate::protocol::constants::MAX_CONTROL_FRAGMENT;
use crate::protocol::Opcode;

/// Byte stream over the control channel's reliability layer.
///
/// Reads pull in-order control payloads and buffer the excess; writes wrap
/// the bytes as `P_CONTROL_V1` packets. Each delivered payload was already
/// acknowledged by the reliability layer at dispatch time.
pub struct ControlStream {
    reliability: Arc<Reliability>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    buffer: BytesMut,
}

impl ControlStream {
    pub fn new(reliability: Arc<Reliability>, incoming: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            reliability,
            incoming,
            buffer: BytesMut::new(),
        }
    }
}

impl AsyncRead for ControlStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.buffer.is_empty() {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(payload)) => self.buffer.extend_from_slice(&payload),
                // Reliability layer gone: surface EOF to the TLS library.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.buffer.len().min(buf.remaining());
        buf.put_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Keep each control packet's payload under the datagram MTU; the
        // TLS layer will call again with the remainder.
        let n = buf.len().min(MAX_CONTROL_FRAGMENT);
        match self
            .reliability
            .send_control(Opcode::ControlV1, Bytes::copy_from_slice(&buf[..n]))
        {
            Ok(_) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Run the TLS handshake over the control stream.
pub async fn handshake(
    options: &Options,
    stream: ControlStream,
) -> Result<TlsStream<ControlStream>> {
    let config = client_config(options)?;
    let connector = TlsConnector::from(Arc::new(config));

    // OpenVPN verifies the peer against the configured CA; the SNI name is
    // the remote host, falling back to a placeholder for bare IPs.
    let server_name = if options.remote.parse::<std::net::IpAddr>().is_ok() {
        ServerName::try_from("openvpn-server".to_string())
            .map_err(|_| Error::tls("failed to create SNI hostname"))?
    } else {
        ServerName::try_from(options.remote.clone())
            .map_err(|_| Error::tls(format!("invalid server name: {}", options.remote)))?
    };

    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("handshake failed: {}", e)))?;
    debug!("TLS handshake over control channel completed");
    Ok(tls)
}

/// Build the rustls client configuration from the options.
fn client_config(options: &Options) -> Result<rustls::ClientConfig> {
    let builder = if options.skip_tls_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        if options.ca.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in parse_certs(&options.ca)? {
                root_store
                    .add(cert)
                    .map_err(|e| Error::tls(format!("bad CA certificate: {}", e)))?;
            }
        }
        rustls::ClientConfig::builder().with_root_certificates(root_store)
    };

    let config = if !options.cert.is_empty() && !options.key.is_empty() {
        let certs = parse_certs(&options.cert)?;
        let key = parse_key(&options.key)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::tls(format!("bad client certificate: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };
    Ok(config)
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::tls(format!("failed to parse certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("no certificates found in PEM"));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| Error::tls(format!("failed to parse key PEM: {}", e)))?
        .ok_or_else(|| Error::tls("no private key found in PEM"))
}

/// Certificate verifier that accepts any certificate.
/// Used when `skip_tls_verify` is set (lab servers with throwaway PKI).
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;
    use crate::session::{Session, SessionId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn setup() -> (
        Arc<Session>,
        Arc<Reliability>,
        mpsc::UnboundedReceiver<Vec<u8>>,
        ControlStream,
    ) {
        let session = Arc::new(Session::new());
        session
            .set_remote_session_id(SessionId::from_bytes([9; 8]))
            .unwrap();
        session.record_inbound_acked(0);
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let (layer, delivered_rx) = Reliability::new(session.clone(), egress_tx);
        let stream = ControlStream::new(layer.clone(), delivered_rx);
        (session, layer, egress_rx, stream)
    }

    #[tokio::test]
    async fn test_read_concatenates_in_order_payloads() {
        let (_session, layer, _egress, mut stream) = setup();
        let sid = SessionId::from_bytes([9; 8]);

        for (pid, chunk) in [(1u32, &b"hel"[..]), (2, &b"lo "[..]), (3, &b"vpn"[..])] {
            layer
                .handle_control(Packet::control(
                    Opcode::ControlV1,
                    0,
                    sid,
                    pid,
                    Bytes::copy_from_slice(chunk),
                ))
                .unwrap();
        }

        // A small read drains the buffer incrementally across payloads.
        let mut out = [0u8; 4];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hell");
        let mut rest = [0u8; 5];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"o vpn");
    }

    #[tokio::test]
    async fn test_write_wraps_as_control_v1() {
        let (session, _layer, mut egress, mut stream) = setup();

        stream.write_all(b"client hello").await.unwrap();
        let bytes = egress.try_recv().unwrap();
        let p = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(p.opcode, Opcode::ControlV1);
        assert_eq!(p.local_session_id, session.local_session_id());
        // Packet id 0 went to the hard reset in a real run; here the counter
        // simply starts at 0.
        assert_eq!(p.packet_id, Some(0));
        assert_eq!(&p.payload[..], b"client hello");
    }
}
