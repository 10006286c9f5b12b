//! Unsigned multisig transactions and their composition
//!
//! The unsigned form is a self-describing value object: each input carries
//! the redeem script, spent value and key list a remote signer needs, so it
//! can be serialized, handed to every holder, and signed independently.

use crate::core::{
    estimate_tx_size, is_dust, multisig_input_size, FeeRate, OutPoint, Script, SigHashType,
    Transaction, TxInput, TxOutput, DUST_LIMIT, TX_VERSION,
};
use crate::crypto::sha256;
use crate::multisig::wallet::{required_signers, MultisigError, ThresholdWallet};
use crate::services::{with_timeout, LedgerService, Utxo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A value-bearing output requested by the caller
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpendOutput {
    pub address: String,
    pub amount: u64,
}

impl SpendOutput {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// Input spending a wallet UTXO, awaiting signatures
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedInput {
    pub outpoint: OutPoint,
    /// P2SH output script of the spent output
    pub locking_script_hex: String,
    pub redeem_script_hex: String,
    /// Value of the spent output, committed to by every signature
    pub value: u64,
    pub public_keys: Vec<String>,
    /// One slot per public key, filled as signatures are applied
    pub partial_signatures: Vec<Option<String>>,
}

/// Output of an unsigned transaction
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedOutput {
    pub value: u64,
    pub script_hex: String,
}

/// A composed transaction that has not been signed yet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub version: u32,
    pub locktime: u32,
    pub inputs: Vec<UnsignedInput>,
    pub outputs: Vec<UnsignedOutput>,
}

impl UnsignedTransaction {
    /// Signatures needed, derived from the first input's key slots
    pub fn required_signatures(&self) -> usize {
        let slots = self
            .inputs
            .first()
            .map(|i| i.partial_signatures.len())
            .unwrap_or(0);
        required_signers(slots)
    }

    /// Short stable identifier of the unsigned content
    pub fn id(&self) -> Result<String, MultisigError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| MultisigError::InvalidUnsignedTx(e.to_string()))?;
        Ok(hex::encode(&sha256(&json)[..16]))
    }

    /// Wire transaction with the current unlocking scripts (empty until finalized)
    pub fn to_transaction(&self) -> Result<Transaction, MultisigError> {
        let inputs = self
            .inputs
            .iter()
            .map(|i| TxInput::new(i.outpoint.clone()))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|o| -> Result<TxOutput, MultisigError> {
                Ok(TxOutput::new(o.value, Script::from_hex(&o.script_hex)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Transaction {
            version: self.version,
            inputs,
            outputs,
            locktime: self.locktime,
        })
    }

    /// Digest a signer must sign for `input_index`
    pub fn signature_digest(
        &self,
        input_index: usize,
        sighash: SigHashType,
    ) -> Result<Vec<u8>, MultisigError> {
        let input = self.input(input_index)?;
        let redeem = Script::from_hex(&input.redeem_script_hex)?;
        Ok(self
            .to_transaction()?
            .signature_digest(input_index, &redeem, input.value, sighash)?)
    }

    pub fn input(&self, input_index: usize) -> Result<&UnsignedInput, MultisigError> {
        self.inputs.get(input_index).ok_or_else(|| {
            MultisigError::InvalidUnsignedTx(format!("input {} out of range", input_index))
        })
    }

    /// Data-carrier payload bytes, if any
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.outputs.iter().find_map(|o| {
            let script = Script::from_hex(&o.script_hex).ok()?;
            if !script.is_data_carrier() {
                return None;
            }
            let ins = script.instructions().ok()?;
            Some(ins.iter().filter_map(|i| i.data()).flatten().copied().collect())
        })
    }

    /// Check every input actually spends from `wallet`
    pub fn check_wallet(&self, wallet: &ThresholdWallet) -> Result<(), MultisigError> {
        if self.inputs.is_empty() {
            return Err(MultisigError::InvalidUnsignedTx("no inputs".to_string()));
        }
        let redeem = wallet.redeem_script()?.to_hex();
        for (index, input) in self.inputs.iter().enumerate() {
            if input.locking_script_hex != wallet.locking_script_hex
                || input.redeem_script_hex != redeem
                || input.public_keys != wallet.public_keys
                || input.partial_signatures.len() != wallet.public_keys.len()
            {
                return Err(MultisigError::InvalidUnsignedTx(format!(
                    "input {} does not spend from {}",
                    index, wallet.address
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Largest UTXO; ties go to the lowest (txid, vout)
pub fn select_utxo(utxos: &[Utxo]) -> Option<&Utxo> {
    utxos.iter().min_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    })
}

/// Build the unsigned spend from a UTXO snapshot
///
/// Output order: data carrier (value 0), the requested spends, then change
/// back to the wallet when it is not dust.
pub fn compose_from_utxos(
    wallet: &ThresholdWallet,
    utxos: &[Utxo],
    payload: &[u8],
    spend_outputs: &[SpendOutput],
    fee_rate: FeeRate,
) -> Result<UnsignedTransaction, MultisigError> {
    let mut outputs = vec![TxOutput::new(0, Script::data_carrier(&[payload])?)];
    for spend in spend_outputs {
        if is_dust(spend.amount) {
            return Err(MultisigError::DustOutput(spend.amount));
        }
        outputs.push(TxOutput::new(spend.amount, Script::for_address(&spend.address)?));
    }
    let change_script = Script::from_hex(&wallet.locking_script_hex)?;

    // Size with a change output, so the fee never undershoots
    let mut sized = outputs.clone();
    sized.push(TxOutput::new(0, change_script.clone()));
    let input_size = multisig_input_size(wallet.required_signers, wallet.signer_count());
    let fee = fee_rate.fee_for_size(estimate_tx_size(&[input_size], &sized));
    let spend_total = spend_outputs.iter().fold(0u64, |acc, s| acc.saturating_add(s.amount));
    let need = spend_total.saturating_add(fee);

    let utxo = match select_utxo(utxos) {
        Some(utxo) if utxo.value >= need => utxo,
        other => {
            return Err(MultisigError::InsufficientFunds {
                have: other.map(|u| u.value).unwrap_or(0),
                need,
            })
        }
    };

    let change = utxo.value - need;
    if change >= DUST_LIMIT {
        outputs.push(TxOutput::new(change, change_script));
    }
    log::debug!(
        "Composed spend of {}:{} ({} sat), fee {} sat, change {} sat",
        utxo.txid,
        utxo.vout,
        utxo.value,
        fee,
        change
    );

    Ok(UnsignedTransaction {
        version: TX_VERSION,
        locktime: 0,
        inputs: vec![UnsignedInput {
            outpoint: utxo.outpoint(),
            locking_script_hex: wallet.locking_script_hex.clone(),
            redeem_script_hex: wallet.redeem_script()?.to_hex(),
            value: utxo.value,
            public_keys: wallet.public_keys.clone(),
            partial_signatures: vec![None; wallet.signer_count()],
        }],
        outputs: outputs
            .into_iter()
            .map(|o| UnsignedOutput {
                value: o.value,
                script_hex: o.script_pubkey.to_hex(),
            })
            .collect(),
    })
}

/// Composes spends against the wallet's current UTXO set
pub struct TransactionComposer {
    ledger: Arc<dyn LedgerService>,
    fee_rate: FeeRate,
    timeout: Duration,
}

impl TransactionComposer {
    pub fn new(ledger: Arc<dyn LedgerService>, fee_rate: FeeRate, timeout: Duration) -> Self {
        Self {
            ledger,
            fee_rate,
            timeout,
        }
    }

    /// Snapshot the wallet's UTXOs and compose the unsigned spend
    pub async fn compose(
        &self,
        wallet: &ThresholdWallet,
        payload: &[u8],
        spend_outputs: &[SpendOutput],
    ) -> Result<UnsignedTransaction, MultisigError> {
        let utxos = with_timeout(self.timeout, self.ledger.get_utxos(&wallet.address)).await?;
        log::info!("Wallet {} has {} UTXO(s)", wallet.address, utxos.len());
        compose_from_utxos(wallet, &utxos, payload, spend_outputs, self.fee_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::multisig::wallet::HolderKey;

    fn wallet(n: usize) -> ThresholdWallet {
        let keys: Vec<HolderKey> = (0..n)
            .map(|_| {
                let kp = KeyPair::generate();
                HolderKey::new(kp.address(), kp.public_key_hex())
            })
            .collect();
        ThresholdWallet::build(&keys).unwrap()
    }

    fn utxo(txid_byte: u8, vout: u32, value: u64) -> Utxo {
        Utxo {
            txid: hex::encode([txid_byte; 32]),
            vout,
            value,
            script_hex: String::new(),
        }
    }

    #[test]
    fn test_select_largest_with_tiebreak() {
        let utxos = vec![utxo(3, 0, 500), utxo(2, 1, 900), utxo(2, 0, 900), utxo(1, 0, 100)];
        let chosen = select_utxo(&utxos).unwrap();
        assert_eq!((chosen.txid.as_str(), chosen.vout), (hex::encode([2u8; 32]).as_str(), 0));
        assert!(select_utxo(&[]).is_none());
    }

    #[test]
    fn test_compose_layout() {
        let w = wallet(3);
        let dest = KeyPair::generate().address();
        let payload = br#"{"cid":"Qm","ts":1}"#;
        let tx = compose_from_utxos(
            &w,
            &[utxo(1, 0, 5_000), utxo(2, 0, 50_000)],
            payload,
            &[SpendOutput::new(&dest, 1_000)],
            FeeRate::from_sat_per_byte(3),
        )
        .unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].value, 50_000);
        assert_eq!(tx.inputs[0].partial_signatures, vec![None, None, None]);
        assert_eq!(tx.required_signatures(), 2);

        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(tx.outputs[0].value, 0);
        assert_eq!(tx.payload().unwrap(), payload.to_vec());
        assert_eq!(
            Script::from_hex(&tx.outputs[1].script_hex).unwrap().address(),
            Some(dest)
        );
        assert_eq!(tx.outputs[2].script_hex, w.locking_script_hex);

        let fee = 50_000 - tx.outputs.iter().map(|o| o.value).sum::<u64>();
        assert!(fee > 0 && fee < 3 * 600);
        tx.check_wallet(&w).unwrap();
    }

    #[test]
    fn test_compose_is_deterministic() {
        let w = wallet(3);
        let utxos = vec![utxo(9, 0, 20_000), utxo(8, 3, 20_000)];
        let spends = vec![SpendOutput::new(KeyPair::generate().address(), 1_000)];
        let a = compose_from_utxos(&w, &utxos, b"p", &spends, FeeRate::default()).unwrap();
        let b = compose_from_utxos(&w, &utxos, b"p", &spends, FeeRate::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id().unwrap(), b.id().unwrap());
    }

    #[test]
    fn test_insufficient_funds() {
        let w = wallet(2);
        let spends = vec![SpendOutput::new(KeyPair::generate().address(), 1_000)];

        let result = compose_from_utxos(&w, &[utxo(1, 0, 1_200)], b"p", &spends, FeeRate::default());
        assert!(matches!(
            result,
            Err(MultisigError::InsufficientFunds { have: 1_200, .. })
        ));

        let result = compose_from_utxos(&w, &[], b"p", &spends, FeeRate::default());
        assert!(matches!(result, Err(MultisigError::InsufficientFunds { have: 0, .. })));
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let w = wallet(1);
        let baseline = compose_from_utxos(&w, &[utxo(1, 0, 100_000)], b"p", &[], FeeRate::default()).unwrap();
        let fee = 100_000 - baseline.outputs[1].value;

        let tight = compose_from_utxos(&w, &[utxo(1, 0, fee + 100)], b"p", &[], FeeRate::default()).unwrap();
        assert_eq!(tight.outputs.len(), 1);
    }

    #[test]
    fn test_dust_spend_rejected() {
        let w = wallet(1);
        let spends = vec![SpendOutput::new(KeyPair::generate().address(), 100)];
        let result = compose_from_utxos(&w, &[utxo(1, 0, 100_000)], b"p", &spends, FeeRate::default());
        assert!(matches!(result, Err(MultisigError::DustOutput(100))));
    }
}
