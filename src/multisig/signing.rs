//! Per-holder signing
//!
//! A holder signs its own copy of the unsigned transaction and returns only
//! signature records; the transaction itself is never sent back.

use crate::core::{Script, SigHashType};
use crate::crypto::{public_key_from_hex, public_key_to_address, verify_signature, KeyPair};
use crate::multisig::transaction::UnsignedTransaction;
use crate::multisig::wallet::MultisigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a signature record was not applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureRejection {
    #[error("input {0} does not exist")]
    InputOutOfRange(usize),
    #[error("signer key is not part of the wallet")]
    UnknownSigner,
    #[error("signer address does not match its public key")]
    AddressMismatch,
    #[error("input locking script does not commit to its redeem script")]
    LockingScriptMismatch,
    #[error("unsupported sighash type {0:#04x}")]
    UnsupportedSigHash(u8),
    #[error("signature does not verify")]
    BadSignature,
    #[error("signer already signed this input")]
    Duplicate,
}

/// One holder's signature over one input
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureRecord {
    pub signer_address: String,
    pub signer_public_key: String,
    pub input_index: usize,
    /// DER-encoded ECDSA signature, hex, without the sighash byte
    pub signature_hex: String,
    pub sighash_type: u8,
}

impl SignatureRecord {
    /// Check the record against the input it targets
    pub fn verify(&self, tx: &UnsignedTransaction) -> Result<(), SignatureRejection> {
        let input = tx
            .inputs
            .get(self.input_index)
            .ok_or(SignatureRejection::InputOutOfRange(self.input_index))?;

        let signer_key = self.signer_public_key.to_lowercase();
        if !input.public_keys.iter().any(|k| *k == signer_key) {
            return Err(SignatureRejection::UnknownSigner);
        }
        let public_key =
            public_key_from_hex(&signer_key).map_err(|_| SignatureRejection::UnknownSigner)?;
        if public_key_to_address(&public_key) != self.signer_address {
            return Err(SignatureRejection::AddressMismatch);
        }

        let redeem = Script::from_hex(&input.redeem_script_hex)
            .map_err(|_| SignatureRejection::LockingScriptMismatch)?;
        if redeem.to_p2sh().to_hex() != input.locking_script_hex {
            return Err(SignatureRejection::LockingScriptMismatch);
        }

        let sighash = SigHashType::from_byte(self.sighash_type)
            .ok_or(SignatureRejection::UnsupportedSigHash(self.sighash_type))?;
        let digest = tx
            .signature_digest(self.input_index, sighash)
            .map_err(|_| SignatureRejection::BadSignature)?;
        let der = hex::decode(&self.signature_hex).map_err(|_| SignatureRejection::BadSignature)?;

        match verify_signature(&public_key, &digest, &der) {
            Ok(true) => Ok(()),
            _ => Err(SignatureRejection::BadSignature),
        }
    }

    /// Signature bytes as pushed in the unlocking script
    pub fn script_signature(&self) -> Option<Vec<u8>> {
        let mut sig = hex::decode(&self.signature_hex).ok()?;
        sig.push(self.sighash_type);
        Some(sig)
    }
}

/// Sign every input whose key set includes `key_pair`
pub fn sign_unsigned(
    tx: &UnsignedTransaction,
    key_pair: &KeyPair,
) -> Result<Vec<SignatureRecord>, MultisigError> {
    let public_key = key_pair.public_key_hex();
    let sighash = SigHashType::default();
    let mut records = Vec::new();

    for (index, input) in tx.inputs.iter().enumerate() {
        if !input.public_keys.contains(&public_key) {
            continue;
        }
        let digest = tx.signature_digest(index, sighash)?;
        records.push(SignatureRecord {
            signer_address: key_pair.address(),
            signer_public_key: public_key.clone(),
            input_index: index,
            signature_hex: hex::encode(key_pair.sign(&digest)?),
            sighash_type: sighash.to_byte(),
        });
    }

    if records.is_empty() {
        return Err(MultisigError::NotASigner(key_pair.address()));
    }
    log::info!("Signed {} input(s) as {}", records.len(), key_pair.address());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FeeRate;
    use crate::multisig::transaction::compose_from_utxos;
    use crate::multisig::wallet::{HolderKey, ThresholdWallet};
    use crate::services::Utxo;

    fn setup() -> (Vec<KeyPair>, UnsignedTransaction) {
        let signers: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let keys: Vec<HolderKey> = signers
            .iter()
            .map(|kp| HolderKey::new(kp.address(), kp.public_key_hex()))
            .collect();
        let wallet = ThresholdWallet::build(&keys).unwrap();
        let utxo = Utxo {
            txid: hex::encode([5u8; 32]),
            vout: 0,
            value: 30_000,
            script_hex: wallet.locking_script_hex.clone(),
        };
        let tx = compose_from_utxos(&wallet, &[utxo], b"payload", &[], FeeRate::default()).unwrap();
        (signers, tx)
    }

    #[test]
    fn test_sign_and_verify() {
        let (signers, tx) = setup();
        let records = sign_unsigned(&tx, &signers[1]).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_index, 0);
        assert_eq!(records[0].sighash_type, 0x41);
        assert_eq!(records[0].verify(&tx), Ok(()));
    }

    #[test]
    fn test_outsider_cannot_sign() {
        let (_, tx) = setup();
        let outsider = KeyPair::generate();
        assert!(matches!(
            sign_unsigned(&tx, &outsider),
            Err(MultisigError::NotASigner(_))
        ));
    }

    #[test]
    fn test_rejections() {
        let (signers, tx) = setup();
        let good = sign_unsigned(&tx, &signers[0]).unwrap().remove(0);

        let mut wrong_input = good.clone();
        wrong_input.input_index = 4;
        assert_eq!(wrong_input.verify(&tx), Err(SignatureRejection::InputOutOfRange(4)));

        let mut spoofed = good.clone();
        spoofed.signer_address = signers[1].address();
        assert_eq!(spoofed.verify(&tx), Err(SignatureRejection::AddressMismatch));

        // Signature by signer 0 relabelled as signer 2
        let mut relabelled = good.clone();
        relabelled.signer_public_key = signers[2].public_key_hex();
        relabelled.signer_address = signers[2].address();
        assert_eq!(relabelled.verify(&tx), Err(SignatureRejection::BadSignature));

        // Valid signature over a different transaction
        let mut other = tx.clone();
        other.outputs[0].script_hex = Script::data_carrier(&[b"other"]).unwrap().to_hex();
        assert_eq!(good.verify(&other), Err(SignatureRejection::BadSignature));

        let mut bad_hash = good.clone();
        bad_hash.sighash_type = 0x03;
        assert_eq!(bad_hash.verify(&tx), Err(SignatureRejection::UnsupportedSigHash(0x03)));
    }
}
