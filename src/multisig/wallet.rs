//! Threshold wallet derivation
//!
//! A wallet is a pure function of its ordered public keys: every participant
//! re-derives the same P2SH address from the same key list, so nobody has to
//! trust the coordinator's copy.

use crate::core::{Script, ScriptError, TransactionError, MAX_MULTISIG_KEYS};
use crate::crypto::{public_key_from_hex, KeyError};
use crate::services::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Errors related to multisig operations
#[derive(Error, Debug)]
pub enum MultisigError {
    #[error("Cannot build a wallet from an empty key set")]
    EmptyKeySet,
    #[error("Too many keys: {0} (max {max})", max = MAX_MULTISIG_KEYS)]
    TooManyKeys(usize),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Duplicate signer public key: {0}")]
    DuplicateSigner(String),
    #[error("Wallet address mismatch: expected {expected}, derived {derived}")]
    AddressMismatch { expected: String, derived: String },
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Output of {0} sat is below the dust limit")]
    DustOutput(u64),
    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },
    #[error("Not a signer of this transaction: {0}")]
    NotASigner(String),
    #[error("Invalid unsigned transaction: {0}")]
    InvalidUnsignedTx(String),
    #[error("Broadcast rejected as a conflicting spend: {0}")]
    BroadcastConflict(String),
    #[error("Invalid round transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::multisig::RoundState,
        to: crate::multisig::RoundState,
    },
    #[error("Script error: {0}")]
    ScriptError(#[from] ScriptError),
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),
}

/// A holder's address with the public key it revealed on-chain
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HolderKey {
    pub address: String,
    pub public_key: String,
}

impl HolderKey {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
        }
    }
}

/// Signatures required to spend from a wallet of `key_count` keys (simple majority)
pub fn required_signers(key_count: usize) -> usize {
    key_count / 2 + 1
}

/// An M-of-N P2SH wallet descriptor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThresholdWallet {
    /// P2SH address (starts with '3')
    pub address: String,
    /// P2SH output script locking funds to the redeem script
    pub locking_script_hex: String,
    /// Compressed public keys, hex, in redeem-script order
    pub public_keys: Vec<String>,
    pub required_signers: usize,
}

impl ThresholdWallet {
    /// Derive the wallet for `keys`, preserving their order
    pub fn build(keys: &[HolderKey]) -> Result<Self, MultisigError> {
        let public_keys: Vec<String> = keys.iter().map(|k| k.public_key.clone()).collect();
        Self::from_public_keys(&public_keys)
    }

    /// Derive the wallet for an ordered list of hex public keys
    pub fn from_public_keys(public_keys: &[String]) -> Result<Self, MultisigError> {
        if public_keys.is_empty() {
            return Err(MultisigError::EmptyKeySet);
        }
        if public_keys.len() > MAX_MULTISIG_KEYS {
            return Err(MultisigError::TooManyKeys(public_keys.len()));
        }

        let mut seen = HashSet::new();
        for key in public_keys {
            public_key_from_hex(key).map_err(|_| MultisigError::InvalidPublicKey(key.clone()))?;
            if !seen.insert(key.to_lowercase()) {
                return Err(MultisigError::DuplicateSigner(key.clone()));
            }
        }

        let required = required_signers(public_keys.len());
        let redeem = redeem_script_for(required, public_keys)?;

        Ok(Self {
            address: redeem.p2sh_address(),
            locking_script_hex: redeem.to_p2sh().to_hex(),
            public_keys: public_keys.iter().map(|k| k.to_lowercase()).collect(),
            required_signers: required,
        })
    }

    /// The `OP_M <keys> OP_N OP_CHECKMULTISIG` script committed to by the address
    pub fn redeem_script(&self) -> Result<Script, MultisigError> {
        redeem_script_for(self.required_signers, &self.public_keys)
    }

    /// Re-derive from the key list and check address and script agree
    pub fn verify_address(&self) -> Result<(), MultisigError> {
        let derived = Self::from_public_keys(&self.public_keys)?;
        if derived != *self {
            return Err(MultisigError::AddressMismatch {
                expected: self.address.clone(),
                derived: derived.address,
            });
        }
        Ok(())
    }

    /// Position of a public key in the redeem script
    pub fn key_index(&self, public_key_hex: &str) -> Option<usize> {
        let needle = public_key_hex.to_lowercase();
        self.public_keys.iter().position(|k| *k == needle)
    }

    /// Number of keys (N)
    pub fn signer_count(&self) -> usize {
        self.public_keys.len()
    }

    /// Get description like "2-of-3"
    pub fn description(&self) -> String {
        format!("{}-of-{}", self.required_signers, self.public_keys.len())
    }
}

fn redeem_script_for(required: usize, public_keys: &[String]) -> Result<Script, MultisigError> {
    let raw: Vec<Vec<u8>> = public_keys
        .iter()
        .map(|k| hex::decode(k).map_err(|_| MultisigError::InvalidPublicKey(k.clone())))
        .collect::<Result<_, _>>()?;
    Ok(Script::multisig(required, &raw)?)
}
