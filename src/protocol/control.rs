//! Control-channel messages carried over the TLS stream.
//!
//! These are not wire packets; they are the plaintext messages exchanged on
//! the TLS byte stream after the handshake: the key method 2 key exchange in
//! both directions, the pull request, and the server's pushed options.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::protocol::constants::{
    AUTH_FAILED, CONTROL_MESSAGE_HEADER, KEY_METHOD, PUSH_REPLY,
};
use crate::session::KeySource;

/// True when the buffer starts with the four-zero-byte control message header.
pub fn is_control_message(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == CONTROL_MESSAGE_HEADER
}

/// True when the buffer is a pushed-options reply.
pub fn is_push_reply(data: &[u8]) -> bool {
    data.len() >= PUSH_REPLY.len() && &data[..PUSH_REPLY.len()] == PUSH_REPLY
}

/// True when the buffer is a credential rejection.
pub fn is_auth_failed(data: &[u8]) -> bool {
    data.len() >= AUTH_FAILED.len() && &data[..AUTH_FAILED.len()] == AUTH_FAILED
}

/// Write a string in OpenVPN's length-prefixed convention: a u16 length that
/// includes the terminating NUL, then the bytes, then the NUL.
fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16 + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Read a string written by [`put_string`].
fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::protocol("control message string truncated"));
    }
    let len = buf.get_u16() as usize;
    if len == 0 {
        return Ok(String::new());
    }
    if buf.remaining() < len {
        return Err(Error::protocol("control message string truncated"));
    }
    let raw = &buf[..len];
    // strip the trailing NUL
    let end = if raw[len - 1] == 0 { len - 1 } else { len };
    let s = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(len);
    Ok(s)
}

/// Encode the client's key exchange message:
/// header, key method, pre-master, r1, r2, options string, user, pass.
pub fn encode_client_control_message(key: &KeySource, options: &Options) -> Result<Vec<u8>> {
    let opts = options.options_string()?;
    let mut buf = BytesMut::with_capacity(4 + 1 + 48 + 32 + 32 + opts.len() + 64);
    buf.extend_from_slice(&CONTROL_MESSAGE_HEADER);
    buf.put_u8(KEY_METHOD);
    buf.extend_from_slice(&key.pre_master);
    buf.extend_from_slice(&key.r1);
    buf.extend_from_slice(&key.r2);
    put_string(&mut buf, &opts);
    put_string(&mut buf, &options.user);
    put_string(&mut buf, &options.pass);
    Ok(buf.to_vec())
}

/// The parsed server key exchange message.
#[derive(Debug)]
pub struct ServerControlMessage {
    pub key: KeySource,
    pub options: String,
}

/// Parse the server's key exchange message: header, key method, r1, r2,
/// options string, then an optional auth token which is ignored.
pub fn parse_server_control_message(data: &[u8]) -> Result<ServerControlMessage> {
    if !is_control_message(data) {
        return Err(Error::protocol("missing control message header"));
    }
    let mut buf = &data[4..];
    if buf.remaining() < 1 + 32 + 32 {
        return Err(Error::protocol("server control message too short"));
    }
    let method = buf.get_u8();
    if method != KEY_METHOD {
        return Err(Error::protocol(format!(
            "unsupported key method: {}",
            method
        )));
    }
    let mut r1 = [0u8; 32];
    buf.copy_to_slice(&mut r1);
    let mut r2 = [0u8; 32];
    buf.copy_to_slice(&mut r2);
    let options = get_string(&mut buf)?;
    Ok(ServerControlMessage {
        key: KeySource::from_remote(r1, r2),
        options,
    })
}

/// Options pushed by the server in its PUSH_REPLY.
#[derive(Debug, Clone, Default)]
pub struct PushedOptions {
    /// Address assigned to our end of the tunnel.
    pub tunnel_ip: String,
    /// Netmask from the ifconfig option.
    pub netmask: String,
    /// Every pushed token, keyed by its first word.
    pub raw: HashMap<String, String>,
}

/// Parse a PUSH_REPLY: comma-separated `<key> <value...>` tokens.
///
/// Only `ifconfig` is interpreted; everything else is retained opaquely.
pub fn parse_push_reply(data: &[u8]) -> Result<PushedOptions> {
    if !is_push_reply(data) {
        return Err(Error::protocol("not a push reply"));
    }
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\0').trim_end();

    let mut pushed = PushedOptions::default();
    for token in text.split(',').skip(1) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let mut words = token.splitn(2, ' ');
        let key = words.next().unwrap_or_default().to_string();
        let value = words.next().unwrap_or_default().to_string();
        if key == "ifconfig" {
            let mut parts = value.split_whitespace();
            pushed.tunnel_ip = parts.next().unwrap_or_default().to_string();
            pushed.netmask = parts.next().unwrap_or_default().to_string();
        }
        pushed.raw.insert(key, value);
    }
    if pushed.tunnel_ip.is_empty() {
        return Err(Error::protocol("push reply carried no ifconfig"));
    }
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Proto;

    fn options() -> Options {
        Options {
            remote: "vpn.example.net".to_string(),
            port: 1194,
            proto: Proto::Udp,
            cipher: "AES-128-CBC".to_string(),
            auth: "SHA1".to_string(),
            ca: String::new(),
            cert: String::new(),
            key: String::new(),
            user: "alice".to_string(),
            pass: "secret".to_string(),
            skip_tls_verify: false,
        }
    }

    #[test]
    fn test_client_control_message_layout() {
        let mut key = KeySource::from_remote([1u8; 32], [2u8; 32]);
        key.pre_master = [9u8; 48];
        let msg = encode_client_control_message(&key, &options()).unwrap();

        assert_eq!(&msg[..4], &[0, 0, 0, 0]);
        assert_eq!(msg[4], 0x02);
        assert_eq!(&msg[5..53], &[9u8; 48][..]);
        assert_eq!(&msg[53..85], &[1u8; 32][..]);
        assert_eq!(&msg[85..117], &[2u8; 32][..]);

        // options string: u16 length including NUL, bytes, NUL
        let opts = options().options_string().unwrap();
        let len = u16::from_be_bytes([msg[117], msg[118]]) as usize;
        assert_eq!(len, opts.len() + 1);
        assert_eq!(&msg[119..119 + opts.len()], opts.as_bytes());
        assert_eq!(msg[119 + opts.len()], 0);

        // user and pass follow, each NUL-terminated
        let tail = &msg[119 + opts.len() + 1..];
        let ulen = u16::from_be_bytes([tail[0], tail[1]]) as usize;
        assert_eq!(ulen, "alice".len() + 1);
        assert_eq!(&tail[2..2 + 5], b"alice");
    }

    #[test]
    fn test_server_control_message_roundtrip() {
        // Mirror of the client layout without the pre-master.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CONTROL_MESSAGE_HEADER);
        buf.put_u8(KEY_METHOD);
        buf.extend_from_slice(&[3u8; 32]);
        buf.extend_from_slice(&[4u8; 32]);
        put_string(&mut buf, "V4,tls-server");

        let msg = parse_server_control_message(&buf).unwrap();
        assert_eq!(msg.key.r1, [3u8; 32]);
        assert_eq!(msg.key.r2, [4u8; 32]);
        assert_eq!(msg.options, "V4,tls-server");
    }

    #[test]
    fn test_server_control_message_rejects_bad_method() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CONTROL_MESSAGE_HEADER);
        buf.put_u8(0x01);
        buf.extend_from_slice(&[0u8; 64]);
        assert!(parse_server_control_message(&buf).is_err());
    }

    #[test]
    fn test_message_classification() {
        assert!(is_control_message(&[0, 0, 0, 0, 2]));
        assert!(!is_control_message(&[0, 0, 0, 1, 2]));
        assert!(!is_control_message(&[0, 0]));
        assert!(is_push_reply(b"PUSH_REPLY,ifconfig 10.0.0.2 255.255.255.0"));
        assert!(is_auth_failed(b"AUTH_FAILED\x00"));
        assert!(!is_auth_failed(b"AUTH"));
    }

    #[test]
    fn test_push_reply_parsing() {
        let reply = b"PUSH_REPLY,route 10.8.0.0 255.255.255.0,dhcp-option DNS 10.8.0.1,ifconfig 10.8.0.6 255.255.255.252,ping 10\x00";
        let pushed = parse_push_reply(reply).unwrap();
        assert_eq!(pushed.tunnel_ip, "10.8.0.6");
        assert_eq!(pushed.netmask, "255.255.255.252");
        assert_eq!(pushed.raw.get("ping").map(String::as_str), Some("10"));
        assert_eq!(
            pushed.raw.get("dhcp-option").map(String::as_str),
            Some("DNS 10.8.0.1")
        );
    }

    #[test]
    fn test_push_reply_without_ifconfig_is_error() {
        assert!(parse_push_reply(b"PUSH_REPLY,ping 10\x00").is_err());
    }
}
