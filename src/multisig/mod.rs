//! Threshold multisig coordination
//!
//! - `wallet`: derive an M-of-N P2SH wallet from ordered public keys
//! - `transaction`: compose the unsigned spend from the wallet's largest UTXO
//! - `signing`: per-holder signature records
//! - `aggregator`: collect records, combine at threshold, broadcast
//! - `round`: the initiator's round state machine

pub mod aggregator;
pub mod round;
pub mod signing;
pub mod transaction;
pub mod wallet;

pub use aggregator::{
    applied_signature_count, combine, CollectFailure, CollectReport, CombineReport,
    FinishOutcome, SignatureAggregator, SignaturePolicy,
};
pub use round::{Delivery, Round, RoundState, RoundStore};
pub use signing::{sign_unsigned, SignatureRecord, SignatureRejection};
pub use transaction::{
    compose_from_utxos, select_utxo, SpendOutput, TransactionComposer, UnsignedInput,
    UnsignedOutput, UnsignedTransaction,
};
pub use wallet::{required_signers, HolderKey, MultisigError, ThresholdWallet};
