//! Thin symmetric-cipher boundary standing in for the out-of-scope secret
//! encryption primitives (spec §1). The Ingestor needs *something* real to
//! call to recover a printer's LAN access code from the encrypted column;
//! this module is deliberately minimal and not a general-purpose KMS.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

const NONCE_LEN: usize = 12;

fn derive_key(secret: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(secret.as_bytes());
    *Key::<Aes256Gcm>::from_slice(&digest)
}

/// Encrypts `plaintext` under `secret`, returning a hex string of
/// `nonce || ciphertext`.
pub fn encrypt_str(secret: &str, plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(&derive_key(secret));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| EngineError::Crypto(e.to_string()))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ct);
    Ok(hex::encode(out))
}

/// Inverse of [`encrypt_str`].
pub fn decrypt_str(secret: &str, ciphertext_hex: &str) -> Result<String> {
    let raw = hex::decode(ciphertext_hex).map_err(|e| EngineError::Crypto(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(EngineError::Crypto("ciphertext too short".into()));
    }
    let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(secret));
    let nonce = Nonce::from_slice(nonce_bytes);
    let pt = cipher
        .decrypt(nonce, ct)
        .map_err(|_| EngineError::Crypto("invalid ciphertext".into()))?;
    String::from_utf8(pt).map_err(|e| EngineError::Crypto(e.to_string()))
}
