//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 / HASH160 hashing
//! - ECDSA key management (secp256k1) and Base58Check addresses
//! - Public-key envelope encryption for relayed messages

pub mod ecies;
pub mod hash;
pub mod keys;

pub use ecies::CipherError;
pub use hash::{double_sha256, hash160, sha256, sha256_hex};
pub use keys::{
    address_to_hash160, base58check_encode, public_key_from_hex, public_key_to_address,
    sign_digest, verify_signature, KeyError, KeyPair, P2PKH_VERSION, P2SH_VERSION,
};
