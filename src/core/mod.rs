//! Core ledger primitives
//!
//! - Script building and decoding (P2PKH, P2SH, multisig, data carrier)
//! - Wire-format transactions and signature digests
//! - Fee and size estimation

pub mod fee;
pub mod script;
pub mod transaction;

pub use fee::{
    estimate_tx_size, is_dust, multisig_input_size, p2pkh_input_size, FeeRate, DEFAULT_FEE_RATE,
    DUST_LIMIT,
};
pub use script::{
    Instruction, OpCode, Script, ScriptError, SigHashType, MAX_DATA_CARRIER_BYTES,
    MAX_MULTISIG_KEYS,
};
pub use transaction::{
    parse_multisig, verify_input, verify_multisig_input, verify_p2pkh_input, OutPoint, Transaction, TransactionError, TxInput, TxOutput,
    SEQUENCE_FINAL, TX_VERSION,
};
