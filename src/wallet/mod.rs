//! Wallet module for key storage and P2PKH spending

pub mod wallet;

pub use wallet::{Wallet, WalletError, WalletInfo, WalletManager};
