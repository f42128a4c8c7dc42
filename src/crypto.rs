//! Sealed-envelope primitives for the relay wire.
//!
//! A payload is AES-256-GCM ciphertext framed by an HMAC-SHA-256 over
//! `nonce ∥ ciphertext ∥ tag`. The signing key is derived from the master key
//! via HKDF-SHA-256, so the sender-authentication surface can be rotated
//! without touching the encryption root. [`open`] verifies the HMAC in
//! constant time before attempting any decryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Length of the master (and derived signing) key in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length: 96 bits.
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length: 128 bits.
const TAG_LEN: usize = 16;
/// Envelope format version.
const VERSION: u8 = 1;
/// HKDF info string for the signing sub-key.
const SIGN_INFO: &[u8] = b"crystal-relay-sign";

/// The versioned envelope that travels over the relay wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPayload {
    pub v: u8,
    /// 96-bit nonce, base64.
    pub nonce: String,
    /// Ciphertext without the tag, base64.
    pub ciphertext: String,
    /// 128-bit GCM tag, base64.
    pub tag: String,
    /// HMAC-SHA-256 of nonce ∥ ciphertext ∥ tag, hex.
    pub hmac: String,
}

/// Encrypt and authenticate plaintext under the master key.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<SealedPayload> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).expect("key length checked by type");
    // The aead crate appends the 16-byte tag to the ciphertext; split it off
    // so the envelope carries them as separate fields.
    let mut sealed = cipher
        .encrypt(nonce, Payload::from(plaintext))
        .map_err(|_| anyhow::anyhow!("AES-GCM encryption failed"))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    let ciphertext = sealed;

    let mac = compute_hmac(key, &nonce_bytes, &ciphertext, &tag);

    Ok(SealedPayload {
        v: VERSION,
        nonce: B64.encode(nonce_bytes),
        ciphertext: B64.encode(&ciphertext),
        tag: B64.encode(&tag),
        hmac: hex::encode(mac),
    })
}

/// Verify and decrypt a sealed payload.
///
/// The HMAC is recomputed and compared in constant time before any AEAD work,
/// so a forged or corrupted envelope is rejected without touching the cipher.
pub fn open(payload: &SealedPayload, key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    if payload.v != VERSION {
        bail!("unsupported envelope version: {}", payload.v);
    }

    let nonce_bytes = B64
        .decode(&payload.nonce)
        .context("invalid base64 in nonce")?;
    let ciphertext = B64
        .decode(&payload.ciphertext)
        .context("invalid base64 in ciphertext")?;
    let tag = B64.decode(&payload.tag).context("invalid base64 in tag")?;
    let claimed_mac = hex::decode(&payload.hmac).context("invalid hex in hmac")?;

    if nonce_bytes.len() != NONCE_LEN {
        bail!("invalid nonce length: {}", nonce_bytes.len());
    }
    if tag.len() != TAG_LEN {
        bail!("invalid tag length: {}", tag.len());
    }

    let sign_key = signing_key(key);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&sign_key).expect("HMAC accepts any key length");
    mac.update(&nonce_bytes);
    mac.update(&ciphertext);
    mac.update(&tag);
    mac.verify_slice(&claimed_mac)
        .map_err(|_| anyhow::anyhow!("HMAC verification failed"))?;

    let cipher = Aes256Gcm::new_from_slice(key).expect("key length checked by type");
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), Payload::from(sealed.as_slice()))
        .map_err(|_| anyhow::anyhow!("AEAD decryption failed"))
}

/// SHA-256 of arbitrary bytes, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Load the master key from a file: trim whitespace, base64-decode, and
/// require exactly 32 bytes.
pub fn load_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let decoded = B64
        .decode(contents.trim())
        .with_context(|| format!("key file {} is not valid base64", path.display()))?;

    if decoded.len() != KEY_LEN {
        bail!(
            "key file {} must decode to exactly {KEY_LEN} bytes, got {}",
            path.display(),
            decoded.len()
        );
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&decoded);
    Ok(key)
}

/// Derive the signing sub-key from the master key: HKDF-SHA-256, empty salt,
/// fixed info string, 32-byte output.
fn signing_key(master: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(SIGN_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF output length");
    okm
}

fn compute_hmac(key: &[u8; KEY_LEN], nonce: &[u8], ciphertext: &[u8], tag: &[u8]) -> Vec<u8> {
    let sign_key = signing_key(key);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&sign_key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(ciphertext);
    mac.update(tag);
    mac.finalize().into_bytes().to_vec()
}
