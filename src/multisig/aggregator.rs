//! Signature collection and combination
//!
//! Records arrive out of band, in whatever order holders answered. Invalid,
//! unauthorized and duplicate records are skipped and reported; once the
//! threshold is met the remaining valid records are reported as ignored.

use crate::core::{Instruction, OpCode, Script, Transaction};
use crate::multisig::signing::{SignatureRecord, SignatureRejection};
use crate::multisig::transaction::UnsignedTransaction;
use crate::multisig::wallet::MultisigError;
use crate::relay::{Envelope, RelayError, SecureRelay};
use crate::services::{with_timeout, LedgerService, ServiceError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Which valid records fill the threshold
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePolicy {
    /// First records received win
    #[default]
    ArrivalOrder,
    /// Lowest wallet key index wins, regardless of arrival
    KeyOrder,
}

/// What happened to each supplied record
#[derive(Clone, Debug, Default)]
pub struct CombineReport {
    pub applied: Vec<SignatureRecord>,
    pub rejected: Vec<(SignatureRecord, SignatureRejection)>,
    /// Valid records beyond the threshold
    pub ignored: Vec<SignatureRecord>,
}

/// Signal that could not be turned into a signature record
#[derive(Debug)]
pub struct CollectFailure {
    pub signal_txid: String,
    pub error: RelayError,
}

/// Partial result of reading many signals
#[derive(Debug, Default)]
pub struct CollectReport {
    pub records: Vec<SignatureRecord>,
    pub failures: Vec<CollectFailure>,
}

/// Apply signatures to `tx`, producing a broadcastable transaction
///
/// The threshold comes from the first input's key slots. Fewer supplied
/// records than that fails outright; otherwise records are considered in the
/// order `policy` dictates and the unlocking script lists the chosen
/// signatures in redeem-script key order.
pub fn combine(
    tx: &UnsignedTransaction,
    records: &[SignatureRecord],
    policy: SignaturePolicy,
) -> Result<(Transaction, CombineReport), MultisigError> {
    let required = tx.required_signatures();
    if records.len() < required {
        return Err(MultisigError::InsufficientSignatures {
            have: records.len(),
            need: required,
        });
    }

    let mut signed = tx.clone();
    let mut report = CombineReport::default();
    let mut ordered: Vec<&SignatureRecord> = records.iter().collect();
    if policy == SignaturePolicy::KeyOrder {
        ordered.sort_by_key(|r| {
            let slot = tx
                .inputs
                .get(r.input_index)
                .and_then(|i| key_slot(&i.public_keys, &r.signer_public_key));
            (r.input_index, slot.unwrap_or(usize::MAX))
        });
    }

    let mut filled = vec![0usize; signed.inputs.len()];
    for record in ordered {
        if let Err(reason) = record.verify(tx) {
            log::warn!("Rejected signature from {}: {}", record.signer_address, reason);
            report.rejected.push((record.clone(), reason));
            continue;
        }

        let index = record.input_index;
        let input = &mut signed.inputs[index];
        let slot = match key_slot(&input.public_keys, &record.signer_public_key) {
            Some(slot) => slot,
            None => {
                report.rejected.push((record.clone(), SignatureRejection::UnknownSigner));
                continue;
            }
        };
        if input.partial_signatures[slot].is_some() {
            report.rejected.push((record.clone(), SignatureRejection::Duplicate));
            continue;
        }
        if filled[index] >= required {
            log::info!("Ignoring extra signature from {}", record.signer_address);
            report.ignored.push(record.clone());
            continue;
        }

        input.partial_signatures[slot] = Some(record.signature_hex.clone());
        filled[index] += 1;
        log::info!(
            "Applied signature {}/{} from {} on input {}",
            filled[index],
            required,
            record.signer_address,
            index
        );
        report.applied.push(record.clone());
    }

    if let Some(short) = filled.iter().copied().find(|&n| n < required) {
        return Err(MultisigError::InsufficientSignatures {
            have: short,
            need: required,
        });
    }

    let mut wire = signed.to_transaction()?;
    for (index, input) in signed.inputs.iter().enumerate() {
        let redeem = Script::from_hex(&input.redeem_script_hex)?;
        // OP_0 covers the extra stack item OP_CHECKMULTISIG pops
        let mut script_sig = Script::new().push_opcode(OpCode::Op0);
        for (slot, sig) in input.partial_signatures.iter().enumerate() {
            if sig.is_none() {
                continue;
            }
            let record = report
                .applied
                .iter()
                .find(|r| {
                    r.input_index == index
                        && key_slot(&input.public_keys, &r.signer_public_key) == Some(slot)
                })
                .and_then(SignatureRecord::script_signature)
                .ok_or_else(|| MultisigError::InvalidUnsignedTx(format!("slot {} lost", slot)))?;
            script_sig = script_sig.push_data(&record);
        }
        wire.inputs[index].script_sig = script_sig.push_data(redeem.as_bytes());
    }

    Ok((wire, report))
}

fn key_slot(public_keys: &[String], key: &str) -> Option<usize> {
    let key = key.to_lowercase();
    public_keys.iter().position(|k| *k == key)
}

/// Signatures found in an already-combined unlocking script
pub fn applied_signature_count(tx: &Transaction, input_index: usize) -> usize {
    tx.inputs
        .get(input_index)
        .and_then(|i| i.script_sig.instructions().ok())
        .map(|ins| {
            ins.iter()
                .filter(|i| matches!(i, Instruction::Push(d) if !d.is_empty()))
                .count()
                .saturating_sub(1)
        })
        .unwrap_or(0)
}

/// Result of a successful finish
#[derive(Debug)]
pub struct FinishOutcome {
    pub txid: String,
    pub report: CombineReport,
}

/// Reads signature responses and broadcasts once the threshold is met
pub struct SignatureAggregator {
    relay: Arc<SecureRelay>,
    ledger: Arc<dyn LedgerService>,
    policy: SignaturePolicy,
    timeout: Duration,
}

impl SignatureAggregator {
    pub fn new(
        relay: Arc<SecureRelay>,
        ledger: Arc<dyn LedgerService>,
        policy: SignaturePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            relay,
            ledger,
            policy,
            timeout,
        }
    }

    /// Read every signal; failures are reported per signal
    pub async fn collect(&self, signal_txids: &[String]) -> CollectReport {
        let reads = signal_txids.iter().map(|txid| async move {
            let received = self.relay.receive(txid).await?;
            match Envelope::from_bytes(&received.payload)? {
                Envelope::Signature(records) => Ok::<_, RelayError>(records),
                other => Err(RelayError::UnexpectedEnvelope(other.kind().to_string())),
            }
        });
        let results = join_all(reads).await;

        let mut report = CollectReport::default();
        for (txid, result) in signal_txids.iter().zip(results) {
            match result {
                Ok(records) => {
                    log::info!("Collected {} signature(s) from signal {}", records.len(), txid);
                    report.records.extend(records);
                }
                Err(error) => {
                    log::warn!("Signal {} unusable: {}", txid, error);
                    report.failures.push(CollectFailure {
                        signal_txid: txid.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    /// Combine and broadcast, returning the txid
    pub async fn finish(
        &self,
        tx: &UnsignedTransaction,
        records: &[SignatureRecord],
    ) -> Result<FinishOutcome, MultisigError> {
        let (wire, report) = combine(tx, records, self.policy)?;
        let raw = wire.to_hex()?;

        let txid = match with_timeout(self.timeout, self.ledger.broadcast(&raw)).await {
            Ok(txid) => txid,
            Err(ServiceError::Conflict(reason)) => {
                return Err(MultisigError::BroadcastConflict(reason))
            }
            Err(e) => return Err(e.into()),
        };
        log::info!("Broadcast multisig spend {}", txid);
        Ok(FinishOutcome { txid, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{verify_input, FeeRate};
    use crate::crypto::KeyPair;
    use crate::multisig::signing::sign_unsigned;
    use crate::multisig::transaction::compose_from_utxos;
    use crate::multisig::wallet::{HolderKey, ThresholdWallet};
    use crate::services::Utxo;

    struct Fixture {
        signers: Vec<KeyPair>,
        wallet: ThresholdWallet,
        tx: UnsignedTransaction,
    }

    fn fixture(n: usize) -> Fixture {
        let signers: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let keys: Vec<HolderKey> = signers
            .iter()
            .map(|kp| HolderKey::new(kp.address(), kp.public_key_hex()))
            .collect();
        let wallet = ThresholdWallet::build(&keys).unwrap();
        let utxo = Utxo {
            txid: hex::encode([7u8; 32]),
            vout: 1,
            value: 40_000,
            script_hex: wallet.locking_script_hex.clone(),
        };
        let tx = compose_from_utxos(&wallet, &[utxo], b"payload", &[], FeeRate::default()).unwrap();
        Fixture { signers, wallet, tx }
    }

    fn sig(f: &Fixture, i: usize) -> SignatureRecord {
        sign_unsigned(&f.tx, &f.signers[i]).unwrap().remove(0)
    }

    fn spends_validly(f: &Fixture, wire: &Transaction) -> bool {
        let script = Script::from_hex(&f.wallet.locking_script_hex).unwrap();
        verify_input(wire, 0, f.tx.inputs[0].value, &script).unwrap()
    }

    #[test]
    fn test_threshold_minus_one_fails() {
        let f = fixture(3);
        let result = combine(&f.tx, &[sig(&f, 0)], SignaturePolicy::ArrivalOrder);
        assert!(matches!(
            result,
            Err(MultisigError::InsufficientSignatures { have: 1, need: 2 })
        ));
    }

    #[test]
    fn test_exact_threshold_succeeds() {
        let f = fixture(3);
        let (wire, report) =
            combine(&f.tx, &[sig(&f, 0), sig(&f, 1)], SignaturePolicy::ArrivalOrder).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(applied_signature_count(&wire, 0), 2);
        assert!(spends_validly(&f, &wire));
    }

    #[test]
    fn test_arrival_order_decides_who_signed() {
        let f = fixture(3);
        // Arrival order C, A, B: C and A are applied, B is ignored
        let records = vec![sig(&f, 2), sig(&f, 0), sig(&f, 1)];
        let (wire, report) = combine(&f.tx, &records, SignaturePolicy::ArrivalOrder).unwrap();

        assert_eq!(report.applied, vec![records[0].clone(), records[1].clone()]);
        assert_eq!(report.ignored, vec![records[2].clone()]);
        // Unlocking script is still in key order, so it verifies
        assert!(spends_validly(&f, &wire));
    }

    #[test]
    fn test_key_order_is_canonical() {
        let f = fixture(3);
        let records = vec![sig(&f, 2), sig(&f, 1), sig(&f, 0)];
        let (wire, report) = combine(&f.tx, &records, SignaturePolicy::KeyOrder).unwrap();

        let applied: Vec<&str> = report.applied.iter().map(|r| r.signer_address.as_str()).collect();
        assert_eq!(applied, vec![f.signers[0].address(), f.signers[1].address()]);
        assert_eq!(report.ignored, vec![records[0].clone()]);
        assert!(spends_validly(&f, &wire));
    }

    #[test]
    fn test_invalid_and_duplicate_records_are_skipped() {
        let f = fixture(3);
        let a = sig(&f, 0);
        let mut forged = sig(&f, 1);
        forged.signature_hex = a.signature_hex.clone();
        let records = vec![a.clone(), a.clone(), forged, sig(&f, 2)];

        let (wire, report) = combine(&f.tx, &records, SignaturePolicy::ArrivalOrder).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].1, SignatureRejection::Duplicate);
        assert_eq!(report.rejected[1].1, SignatureRejection::BadSignature);
        assert!(spends_validly(&f, &wire));
    }

    #[test]
    fn test_enough_records_but_too_few_valid() {
        let f = fixture(3);
        let a = sig(&f, 0);
        let result = combine(&f.tx, &[a.clone(), a], SignaturePolicy::ArrivalOrder);
        assert!(matches!(
            result,
            Err(MultisigError::InsufficientSignatures { have: 1, need: 2 })
        ));
    }

    #[test]
    fn test_single_key_wallet() {
        let f = fixture(1);
        let (wire, _) = combine(&f.tx, &[sig(&f, 0)], SignaturePolicy::ArrivalOrder).unwrap();
        assert!(spends_validly(&f, &wire));
    }
}
