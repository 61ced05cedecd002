//! Cryptographic primitives for the data channel.
//!
//! This module provides:
//! - The cipher abstraction the data channel branches on (CBC vs AEAD)
//! - HMAC selection and computation for the packet authenticator
//! - Random byte generation for IVs, session ids and key sources

mod prf;

pub use prf::{openvpn_prf, MASTER_SECRET_LABEL, KEY_EXPANSION_LABEL};

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Data-channel cipher.
///
/// The AEAD variants are recognized by name but remain unimplemented;
/// selecting one yields [`Error::Unsupported`] at key setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl Cipher {
    /// Parse an OpenVPN cipher name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "AES-128-CBC" => Ok(Cipher::Aes128Cbc),
            "AES-192-CBC" => Ok(Cipher::Aes192Cbc),
            "AES-256-CBC" => Ok(Cipher::Aes256Cbc),
            "AES-128-GCM" => Ok(Cipher::Aes128Gcm),
            "AES-256-GCM" => Ok(Cipher::Aes256Gcm),
            other => Err(Error::config(format!("unknown cipher: {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes192Cbc => "AES-192-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
        }
    }

    /// Cipher key length in bytes; subkeys are truncated to this on use.
    pub fn key_len(&self) -> usize {
        match self {
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes192Cbc => 24,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm => 32,
        }
    }

    /// Block size in bytes; the IV carried on each data packet is this long.
    pub fn block_size(&self) -> usize {
        16
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, Cipher::Aes128Gcm | Cipher::Aes256Gcm)
    }

    /// CBC-encrypt with PKCS#7 padding.
    pub fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let bad_key = |_| Error::crypto("invalid cipher key or IV length");
        let ct = match self {
            Cipher::Aes128Cbc => Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes192Cbc => Aes192CbcEnc::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes256Cbc => Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Cipher::Aes128Gcm | Cipher::Aes256Gcm => {
                return Err(Error::unsupported("AEAD cipher not implemented"))
            }
        };
        Ok(ct)
    }

    /// CBC-decrypt and strip PKCS#7 padding.
    pub fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let bad_key = |_| Error::crypto("invalid cipher key or IV length");
        let bad_pad = |_| Error::crypto("bad PKCS#7 padding");
        let pt = match self {
            Cipher::Aes128Cbc => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(bad_pad)?,
            Cipher::Aes192Cbc => Aes192CbcDec::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(bad_pad)?,
            Cipher::Aes256Cbc => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(bad_pad)?,
            Cipher::Aes128Gcm | Cipher::Aes256Gcm => {
                return Err(Error::unsupported("AEAD cipher not implemented"))
            }
        };
        Ok(pt)
    }
}

/// Data-channel HMAC algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    Sha1,
    Sha256,
    Sha512,
}

impl Auth {
    /// Parse an OpenVPN auth name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "SHA1" => Ok(Auth::Sha1),
            "SHA256" => Ok(Auth::Sha256),
            "SHA512" => Ok(Auth::Sha512),
            other => Err(Error::config(format!("unknown auth: {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Auth::Sha1 => "SHA1",
            Auth::Sha256 => "SHA256",
            Auth::Sha512 => "SHA512",
        }
    }

    /// HMAC output length in bytes; keys are truncated to this on use.
    pub fn hash_len(&self) -> usize {
        match self {
            Auth::Sha1 => 20,
            Auth::Sha256 => 32,
            Auth::Sha512 => 64,
        }
    }

    /// Compute HMAC over `parts` concatenated.
    pub fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        fn digest<M: Mac + hmac::digest::KeyInit>(
            key: &[u8],
            parts: &[&[u8]],
        ) -> Result<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|_| Error::crypto("invalid HMAC key length"))?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        }
        match self {
            Auth::Sha1 => digest::<Hmac<Sha1>>(key, parts),
            Auth::Sha256 => digest::<Hmac<Sha256>>(key, parts),
            Auth::Sha512 => digest::<Hmac<Sha512>>(key, parts),
        }
    }
}

/// Generate random bytes using a cryptographically secure RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate random bytes into a slice.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}
