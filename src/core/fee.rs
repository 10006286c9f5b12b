//! Fee calculation
//!
//! Linear sat/byte fees over an estimate of the fully signed transaction
//! size, so a fee chosen before any signature exists still covers the
//! final serialized bytes.

use crate::core::transaction::{compact_size_len, TxOutput};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Smallest output value relays accept
pub const DUST_LIMIT: u64 = 546;

/// Default fee rate (sat/byte)
pub const DEFAULT_FEE_RATE: u64 = 3;

/// Upper bound of a DER signature plus its sighash byte
pub const MAX_SIGNATURE_SIZE: usize = 73;

/// Compressed public key length
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Outpoint (36) plus sequence (4)
const INPUT_FIXED_SIZE: usize = 40;

/// Version (4) plus locktime (4)
const TX_FIXED_SIZE: usize = 8;

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in satoshis per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create from satoshis per byte
    pub fn from_sat_per_byte(rate: u64) -> Self {
        Self(rate)
    }

    /// Calculate fee for a given size
    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        self.0 * size_bytes as u64
    }

    /// Get rate as satoshis per byte
    pub fn as_sat_per_byte(&self) -> u64 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(DEFAULT_FEE_RATE)
    }
}

// =============================================================================
// Size estimation
// =============================================================================

fn push_len(data_len: usize) -> usize {
    let prefix = match data_len {
        0..=75 => 1,
        76..=255 => 2,
        256..=65535 => 3,
        _ => 5,
    };
    prefix + data_len
}

fn input_size(script_sig_len: usize) -> usize {
    INPUT_FIXED_SIZE + compact_size_len(script_sig_len) + script_sig_len
}

/// Signed size of a P2PKH input (`<sig> <pubkey>`)
pub fn p2pkh_input_size() -> usize {
    input_size(push_len(MAX_SIGNATURE_SIZE) + push_len(PUBLIC_KEY_SIZE))
}

/// Length of an `m`-of-`n` redeem script with compressed keys
pub fn multisig_redeem_size(n: usize) -> usize {
    // OP_M <n pushes> OP_N OP_CHECKMULTISIG
    3 + n * push_len(PUBLIC_KEY_SIZE)
}

/// Signed size of a P2SH multisig input (`OP_0 <m sigs> <redeem>`)
pub fn multisig_input_size(m: usize, n: usize) -> usize {
    let script_sig = 1 + m * push_len(MAX_SIGNATURE_SIZE) + push_len(multisig_redeem_size(n));
    input_size(script_sig)
}

/// Estimated size of a signed transaction given each input's signed size
pub fn estimate_tx_size(input_sizes: &[usize], outputs: &[TxOutput]) -> usize {
    TX_FIXED_SIZE
        + compact_size_len(input_sizes.len())
        + input_sizes.iter().sum::<usize>()
        + compact_size_len(outputs.len())
        + outputs.iter().map(TxOutput::size).sum::<usize>()
}

/// Whether an output value would be rejected as dust
pub fn is_dust(value: u64) -> bool {
    value < DUST_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Script;
    use crate::core::transaction::{OutPoint, Transaction, TxInput};
    use crate::crypto::KeyPair;

    #[test]
    fn test_fee_rate() {
        let rate = FeeRate::from_sat_per_byte(3);
        assert_eq!(rate.fee_for_size(250), 750);
        assert_eq!(FeeRate::default().as_sat_per_byte(), DEFAULT_FEE_RATE);
    }

    #[test]
    fn test_p2pkh_estimate_bounds_real_size() {
        let owner = KeyPair::generate();
        let outputs = vec![TxOutput::new(
            1_000,
            Script::for_address(&owner.address()).unwrap(),
        )];
        let mut tx = Transaction::new(
            vec![TxInput::new(OutPoint::new(hex::encode([7u8; 32]), 0))],
            outputs.clone(),
        );
        tx.sign_p2pkh_input(0, &owner, 5_000).unwrap();

        let actual = tx.to_bytes().unwrap().len();
        let estimate = estimate_tx_size(&[p2pkh_input_size()], &outputs);
        assert!(estimate >= actual);
        assert!(estimate - actual <= 4);
    }

    #[test]
    fn test_multisig_sizes_grow_with_keys() {
        assert_eq!(multisig_redeem_size(3), 105);
        assert!(multisig_input_size(2, 3) < multisig_input_size(3, 5));
        // 15-of-15 redeem script needs a PUSHDATA2 prefix
        assert_eq!(push_len(multisig_redeem_size(15)), multisig_redeem_size(15) + 3);
    }

    #[test]
    fn test_dust() {
        assert!(is_dust(545));
        assert!(!is_dust(DUST_LIMIT));
    }
}
