//! Client configuration.
//!
//! The protocol engine consumes a populated [`Options`] record; the JSON
//! loader here is the thin shell that produces one from a config file.

use serde::{Deserialize, Serialize};

use crate::crypto::{Auth, Cipher};
use crate::error::{Error, Result};

/// Default OpenVPN server port.
pub const DEFAULT_PORT: u16 = 1194;

/// Transport protocol beneath the OpenVPN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    pub fn name(&self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
        }
    }
}

impl Default for Proto {
    fn default() -> Self {
        Proto::Udp
    }
}

/// Options for a single OpenVPN connection.
///
/// Certificate material is carried as PEM strings. Authentication requires
/// either `cert` + `key` or `user` + `pass`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Server hostname or IP address
    pub remote: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport protocol (only UDP is driven end to end)
    #[serde(default)]
    pub proto: Proto,

    /// Negotiated data-channel cipher name, e.g. "AES-256-CBC"
    #[serde(default = "default_cipher")]
    pub cipher: String,

    /// Negotiated HMAC name, e.g. "SHA1"
    #[serde(default = "default_auth")]
    pub auth: String,

    /// CA certificate (PEM)
    #[serde(default)]
    pub ca: String,

    /// Client certificate (PEM)
    #[serde(default)]
    pub cert: String,

    /// Client private key (PEM)
    #[serde(default)]
    pub key: String,

    /// Username for user/pass authentication
    #[serde(default)]
    pub user: String,

    /// Password for user/pass authentication
    #[serde(default)]
    pub pass: String,

    /// Disable TLS certificate verification (insecure)
    #[serde(default)]
    pub skip_tls_verify: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_cipher() -> String {
    "AES-256-CBC".to_string()
}
fn default_auth() -> String {
    "SHA1".to_string()
}

impl Options {
    /// Validate the options before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.remote.is_empty() {
            return Err(Error::config("remote host is required"));
        }
        if self.port == 0 {
            return Err(Error::config("remote port is required"));
        }
        if self.proto != Proto::Udp {
            return Err(Error::config("only proto udp is supported"));
        }
        let cipher = Cipher::from_name(&self.cipher)?;
        if cipher.is_aead() {
            return Err(Error::unsupported(format!(
                "AEAD cipher not implemented: {}",
                self.cipher
            )));
        }
        Auth::from_name(&self.auth)?;

        let has_cert = !self.cert.is_empty() && !self.key.is_empty();
        let has_userpass = !self.user.is_empty() && !self.pass.is_empty();
        if !has_cert && !has_userpass {
            return Err(Error::config(
                "either cert+key or user+pass credentials are required",
            ));
        }
        Ok(())
    }

    /// Parsed data-channel cipher.
    pub fn data_cipher(&self) -> Result<Cipher> {
        Cipher::from_name(&self.cipher)
    }

    /// Parsed data-channel HMAC.
    pub fn data_auth(&self) -> Result<Auth> {
        Auth::from_name(&self.auth)
    }

    /// The options string sent in the client control message.
    ///
    /// The server compares this occ-style line against its own; keysize is
    /// the cipher key length in bits.
    pub fn options_string(&self) -> Result<String> {
        let cipher = self.data_cipher()?;
        Ok(format!(
            "V4,dev-type tun,link-mtu 1543,tun-mtu 1500,proto UDPv4,cipher {},auth {},keysize {},key-method 2,tls-client",
            cipher.name(),
            self.auth.to_uppercase(),
            cipher.key_len() * 8,
        ))
    }
}

/// Config file loading (simple JSON format for the CLI).
pub mod io {
    use super::*;
    use anyhow::Context;
    use std::path::Path;

    /// Load [`Options`] from a JSON file, resolving certificate paths.
    ///
    /// The file carries either inline PEM under `ca`/`cert`/`key` or paths
    /// under `ca_file`/`cert_file`/`key_file`.
    #[derive(Debug, Deserialize)]
    struct FileConfig {
        #[serde(flatten)]
        options: Options,
        #[serde(default)]
        ca_file: String,
        #[serde(default)]
        cert_file: String,
        #[serde(default)]
        key_file: String,
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Options> {
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let fc: FileConfig = serde_json::from_str(&data).context("parsing config JSON")?;
        let mut options = fc.options;
        if options.ca.is_empty() && !fc.ca_file.is_empty() {
            options.ca = std::fs::read_to_string(&fc.ca_file)
                .with_context(|| format!("reading CA file {}", fc.ca_file))?;
        }
        if options.cert.is_empty() && !fc.cert_file.is_empty() {
            options.cert = std::fs::read_to_string(&fc.cert_file)
                .with_context(|| format!("reading cert file {}", fc.cert_file))?;
        }
        if options.key.is_empty() && !fc.key_file.is_empty() {
            options.key = std::fs::read_to_string(&fc.key_file)
                .with_context(|| format!("reading key file {}", fc.key_file))?;
        }
        Ok(options)
    }
}
