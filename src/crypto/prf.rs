//! OpenVPN key derivation PRF.
//!
//! OpenVPN's key method 2 uses the TLS 1.0 PRF: the secret is split in two
//! halves, each expanded with an HMAC-based P_hash (MD5 for the first half,
//! SHA-1 for the second), and the two output streams are XORed together.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;

use crate::error::{Error, Result};

/// Label fed to the PRF when deriving the master secret.
pub const MASTER_SECRET_LABEL: &[u8] = b"OpenVPN master secret";

/// Label fed to the PRF when expanding the master secret into subkeys.
pub const KEY_EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

/// TLS 1.0 P_hash expansion: HMAC chained over A(i) blocks.
fn p_hash<M: Mac + hmac::digest::KeyInit>(
    secret: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Result<Vec<u8>> {
    fn mac_of<M: Mac + hmac::digest::KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        let mut mac = <M as Mac>::new_from_slice(key)
            .map_err(|_| Error::crypto("invalid PRF secret length"))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }

    let mut a = mac_of::<M>(secret, &[seed])?;
    let mut out = Vec::with_capacity(out_len);
    while out.len() < out_len {
        let block = mac_of::<M>(secret, &[&a, seed])?;
        out.extend_from_slice(&block);
        a = mac_of::<M>(secret, &[&a])?;
    }
    out.truncate(out_len);
    Ok(out)
}

/// TLS 1.0 PRF: MD5 half XOR SHA-1 half.
///
/// The secret halves overlap by one byte when the secret length is odd.
fn tls1_prf(secret: &[u8], seed: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let half = secret.len() / 2 + secret.len() % 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let md5_out = p_hash::<Hmac<Md5>>(s1, seed, out_len)?;
    let sha1_out = p_hash::<Hmac<Sha1>>(s2, seed, out_len)?;

    Ok(md5_out
        .iter()
        .zip(sha1_out.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}

/// The OpenVPN PRF.
///
/// The seed is the label followed by both random seeds and, for the key
/// expansion step, both session ids.
pub fn openvpn_prf(
    secret: &[u8],
    label: &[u8],
    client_seed: &[u8],
    server_seed: &[u8],
    client_sid: Option<&[u8; 8]>,
    server_sid: Option<&[u8; 8]>,
    out_len: usize,
) -> Result<Vec<u8>> {
    let mut seed = Vec::with_capacity(label.len() + client_seed.len() + server_seed.len() + 16);
    seed.extend_from_slice(label);
    seed.extend_from_slice(client_seed);
    seed.extend_from_slice(server_seed);
    if let Some(sid) = client_sid {
        seed.extend_from_slice(sid);
    }
    if let Some(sid) = server_sid {
        seed.extend_from_slice(sid);
    }
    tls1_prf(secret, &seed, out_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_deterministic() {
        let secret = [0u8; 48];
        let r1 = [0u8; 32];
        let a = openvpn_prf(&secret, MASTER_SECRET_LABEL, &r1, &r1, None, None, 48).unwrap();
        let b = openvpn_prf(&secret, MASTER_SECRET_LABEL, &r1, &r1, None, None, 48).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
    }

    #[test]
    fn test_prf_output_lengths() {
        let secret = [7u8; 48];
        let seed = [1u8; 32];
        for len in [1usize, 20, 48, 64, 256] {
            let out =
                openvpn_prf(&secret, KEY_EXPANSION_LABEL, &seed, &seed, None, None, len).unwrap();
            assert_eq!(out.len(), len);
        }
    }

    #[test]
    fn test_prf_inputs_matter() {
        let secret = [7u8; 48];
        let r = [1u8; 32];
        let base = openvpn_prf(&secret, MASTER_SECRET_LABEL, &r, &r, None, None, 48).unwrap();

        let other_secret = [8u8; 48];
        assert_ne!(
            base,
            openvpn_prf(&other_secret, MASTER_SECRET_LABEL, &r, &r, None, None, 48).unwrap()
        );

        let other_seed = [2u8; 32];
        assert_ne!(
            base,
            openvpn_prf(&secret, MASTER_SECRET_LABEL, &other_seed, &r, None, None, 48).unwrap()
        );

        assert_ne!(
            base,
            openvpn_prf(&secret, KEY_EXPANSION_LABEL, &r, &r, None, None, 48).unwrap()
        );

        let sid = [9u8; 8];
        assert_ne!(
            base,
            openvpn_prf(
                &secret,
                MASTER_SECRET_LABEL,
                &r,
                &r,
                Some(&sid),
                Some(&sid),
                48
            )
            .unwrap()
        );
    }

    // The two P_hash streams must actually both contribute; a regression that
    // drops one half would still be deterministic, so pin the XOR structure.
    #[test]
    fn test_prf_xor_structure() {
        let secret = [3u8; 48];
        let seed = b"seed bytes";
        let out = tls1_prf(&secret, seed, 32).unwrap();
        let md5_half = p_hash::<Hmac<Md5>>(&secret[..24], seed, 32).unwrap();
        let sha1_half = p_hash::<Hmac<Sha1>>(&secret[24..], seed, 32).unwrap();
        let xored: Vec<u8> = md5_half
            .iter()
            .zip(sha1_half.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(out, xored);
        assert_ne!(out, md5_half);
        assert_ne!(out, sha1_half);
    }
}
