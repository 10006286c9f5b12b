//! Multisig Relay: threshold wallet coordination over an encrypted relay
//!
//! This crate provides:
//! - Key discovery for the holders of a group token's member NFTs
//! - M-of-N P2SH wallets derived from those holders' public keys
//! - Unsigned spend composition, per-holder signing and threshold combination
//! - End-to-end encrypted messages signalled with on-chain dust markers
//! - An in-process network standing in for the ledger, token registry,
//!   blob store and Nostr relay
//!
//! # Example
//!
//! ```rust
//! use multisig_relay::multisig::{HolderKey, ThresholdWallet};
//! use multisig_relay::crypto::KeyPair;
//!
//! let keys: Vec<HolderKey> = (0..3)
//!     .map(|_| {
//!         let kp = KeyPair::generate();
//!         HolderKey::new(kp.address(), kp.public_key_hex())
//!     })
//!     .collect();
//!
//! let wallet = ThresholdWallet::build(&keys).unwrap();
//! assert_eq!(wallet.description(), "2-of-3");
//! assert!(wallet.address.starts_with('3'));
//! ```

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod crypto;
pub mod multisig;
pub mod relay;
pub mod services;
pub mod token;
pub mod wallet;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{CoordinatorError, Toolkit};
pub use crypto::KeyPair;
pub use multisig::{HolderKey, SignaturePolicy, ThresholdWallet, UnsignedTransaction};
pub use relay::{Channel, Envelope, SecureRelay};
pub use services::{LocalNetwork, Services};
pub use token::{KeyCollector, KeyLookup};
pub use wallet::Wallet;
