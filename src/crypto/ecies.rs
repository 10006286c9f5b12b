//! Public-key envelope encryption
//!
//! A fresh ephemeral secp256k1 key is agreed with the recipient's public key
//! via ECDH; the shared secret is stretched with HKDF-SHA256 into an
//! AES-256-GCM key. Only the holder of the recipient's private key can open
//! the envelope.
//!
//! Wire layout: `ephemeral_pubkey (33) || nonce (12) || ciphertext || tag (16)`

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use thiserror::Error;

const EPHEMERAL_KEY_LEN: usize = 33;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"multisig-relay/ecies/v1";

/// Envelope encryption errors
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("Invalid ephemeral key")]
    InvalidEphemeralKey,
    #[error("Ciphertext is not valid hex")]
    InvalidHex,
    #[error("Decryption failed")]
    Decryption,
    #[error("Encryption failed")]
    Encryption,
}

fn derive_key(shared: &SharedSecret, ephemeral: &PublicKey) -> Result<[u8; 32], CipherError> {
    let hk = Hkdf::<Sha256>::new(Some(&ephemeral.serialize()), &shared.secret_bytes());
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|_| CipherError::Encryption)?;
    Ok(key)
}

/// Encrypt `plaintext` so only the owner of `recipient` can read it
pub fn encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let secp = Secp256k1::new();
    let (ephemeral_secret, ephemeral_public) = secp.generate_keypair(&mut OsRng);

    let shared = SharedSecret::new(recipient, &ephemeral_secret);
    let key = derive_key(&shared, &ephemeral_public)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::Encryption)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encryption)?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&ephemeral_public.serialize());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope produced by [`encrypt`]
pub fn decrypt(secret: &SecretKey, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
    if envelope.len() < EPHEMERAL_KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(CipherError::Truncated(envelope.len()));
    }

    let (ephemeral_bytes, rest) = envelope.split_at(EPHEMERAL_KEY_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral =
        PublicKey::from_slice(ephemeral_bytes).map_err(|_| CipherError::InvalidEphemeralKey)?;
    let shared = SharedSecret::new(&ephemeral, secret);
    let key = derive_key(&shared, &ephemeral)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::Decryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Decryption)
}

/// Hex convenience wrapper around [`encrypt`]
pub fn encrypt_hex(recipient: &PublicKey, plaintext: &[u8]) -> Result<String, CipherError> {
    encrypt(recipient, plaintext).map(hex::encode)
}

/// Hex convenience wrapper around [`decrypt`]
pub fn decrypt_hex(secret: &SecretKey, envelope_hex: &str) -> Result<Vec<u8>, CipherError> {
    let envelope = hex::decode(envelope_hex.trim()).map_err(|_| CipherError::InvalidHex)?;
    decrypt(secret, &envelope)
}
