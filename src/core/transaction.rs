//! Wire-format transactions
//!
//! Bitcoin-style serialization (CompactSize counts, little-endian integers,
//! byte-reversed txids) together with the replay-protected signature digest
//! used for both P2PKH and P2SH-multisig inputs.

use crate::core::script::{Instruction, OpCode, Script, ScriptError, SigHashType};
use crate::crypto::{double_sha256, public_key_from_hex, public_key_to_address, KeyError, KeyPair};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Transaction version emitted by this crate
pub const TX_VERSION: u32 = 2;

/// Sequence number that disables locktime and RBF
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction truncated at byte {0}")]
    Truncated(usize),
    #[error("Trailing bytes after transaction: {0}")]
    TrailingBytes(usize),
    #[error("Invalid outpoint txid: {0}")]
    InvalidTxid(String),
    #[error("Input index {0} out of range")]
    InputOutOfRange(usize),
    #[error("Invalid transaction hex")]
    InvalidHex,
    #[error("Script error: {0}")]
    ScriptError(#[from] ScriptError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

// =============================================================================
// Outpoints, inputs, outputs
// =============================================================================

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    /// Txid in display (big-endian hex) order
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), TransactionError> {
        let mut txid =
            hex::decode(&self.txid).map_err(|_| TransactionError::InvalidTxid(self.txid.clone()))?;
        if txid.len() != 32 {
            return Err(TransactionError::InvalidTxid(self.txid.clone()));
        }
        txid.reverse();
        out.extend_from_slice(&txid);
        out.extend_from_slice(&self.vout.to_le_bytes());
        Ok(())
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxInput {
    /// Unsigned input spending `previous_output`
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    /// Public key revealed by a P2PKH spend (`<sig> <pubkey>`)
    pub fn revealed_public_key(&self) -> Option<PublicKey> {
        let ins = self.script_sig.instructions().ok()?;
        match ins.as_slice() {
            [Instruction::Push(_sig), Instruction::Push(key)] => PublicKey::from_slice(key).ok(),
            _ => None,
        }
    }

    /// Address whose output this input spends, recovered from the unlocking script
    pub fn spender_address(&self) -> Option<String> {
        if let Some(key) = self.revealed_public_key() {
            return Some(public_key_to_address(&key));
        }
        // P2SH spends end with the serialized redeem script
        let ins = self.script_sig.instructions().ok()?;
        match ins.last() {
            Some(Instruction::Push(redeem)) if ins.len() > 1 => {
                Some(Script::from_bytes(redeem.clone()).p2sh_address())
            }
            _ => None,
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Script,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, self.script_pubkey.as_bytes());
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        8 + compact_size_len(self.script_pubkey.len()) + self.script_pubkey.len()
    }
}

// =============================================================================
// CompactSize helpers
// =============================================================================

pub(crate) fn compact_size_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn write_compact_size(out: &mut Vec<u8>, n: usize) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&(n as u64).to_le_bytes());
        }
    }
}

fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len());
    out.extend_from_slice(bytes);
}

/// Cursor over raw transaction bytes
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TransactionError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(TransactionError::Truncated(self.pos))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(TransactionError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, TransactionError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, TransactionError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn compact_size(&mut self) -> Result<usize, TransactionError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            0xfe => self.u32()? as usize,
            0xff => usize::try_from(self.u64()?).map_err(|_| TransactionError::Truncated(self.pos))?,
            n => n as usize,
        })
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>, TransactionError> {
        let len = self.compact_size()?;
        Ok(self.take(len)?.to_vec())
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A wire-format transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl Transaction {
    /// Create a new transaction (unsigned)
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            locktime: 0,
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());

        write_compact_size(&mut out, self.inputs.len());
        for input in &self.inputs {
            input.previous_output.write(&mut out)?;
            write_var_bytes(&mut out, input.script_sig.as_bytes());
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_compact_size(&mut out, self.outputs.len());
        for output in &self.outputs {
            output.write(&mut out);
        }

        out.extend_from_slice(&self.locktime.to_le_bytes());
        Ok(out)
    }

    /// Serialize to lowercase hex
    pub fn to_hex(&self) -> Result<String, TransactionError> {
        self.to_bytes().map(hex::encode)
    }

    /// Parse wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut r = Reader { bytes, pos: 0 };
        let version = r.u32()?;

        let input_count = r.compact_size()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let mut txid = r.take(32)?.to_vec();
            txid.reverse();
            let vout = r.u32()?;
            let script_sig = Script::from_bytes(r.var_bytes()?);
            let sequence = r.u32()?;
            inputs.push(TxInput {
                previous_output: OutPoint::new(hex::encode(txid), vout),
                script_sig,
                sequence,
            });
        }

        let output_count = r.compact_size()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = r.u64()?;
            let script_pubkey = Script::from_bytes(r.var_bytes()?);
            outputs.push(TxOutput::new(value, script_pubkey));
        }

        let locktime = r.u32()?;
        if r.pos != bytes.len() {
            return Err(TransactionError::TrailingBytes(bytes.len() - r.pos));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    /// Parse a hex-encoded transaction
    pub fn from_hex(hex_str: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| TransactionError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    /// Transaction id: double SHA-256 of the wire bytes, byte-reversed
    pub fn txid(&self) -> Result<String, TransactionError> {
        let mut hash = double_sha256(&self.to_bytes()?);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    /// Signature digest for one input
    ///
    /// Commits to every outpoint and sequence, the spent output's script code
    /// and value, and every output (BIP-143 layout with the fork-id flag).
    pub fn signature_digest(
        &self,
        input_index: usize,
        script_code: &Script,
        value: u64,
        sighash: SigHashType,
    ) -> Result<Vec<u8>, TransactionError> {
        let input = self
            .inputs
            .get(input_index)
            .ok_or(TransactionError::InputOutOfRange(input_index))?;

        let mut prevouts = Vec::new();
        let mut sequences = Vec::new();
        for txin in &self.inputs {
            txin.previous_output.write(&mut prevouts)?;
            sequences.extend_from_slice(&txin.sequence.to_le_bytes());
        }

        let mut outputs = Vec::new();
        for output in &self.outputs {
            output.write(&mut outputs);
        }

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&prevouts));
        preimage.extend_from_slice(&double_sha256(&sequences));
        input.previous_output.write(&mut preimage)?;
        write_var_bytes(&mut preimage, script_code.as_bytes());
        preimage.extend_from_slice(&value.to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&outputs));
        preimage.extend_from_slice(&self.locktime.to_le_bytes());
        preimage.extend_from_slice(&(sighash.to_byte() as u32).to_le_bytes());

        Ok(double_sha256(&preimage))
    }

    /// Sign a P2PKH input owned by `key_pair`
    pub fn sign_p2pkh_input(
        &mut self,
        input_index: usize,
        key_pair: &KeyPair,
        value: u64,
    ) -> Result<(), TransactionError> {
        let script_code = Script::for_address(&key_pair.address())?;
        let sighash = SigHashType::default();
        let digest = self.signature_digest(input_index, &script_code, value, sighash)?;

        let mut signature = key_pair.sign(&digest)?;
        signature.push(sighash.to_byte());

        let script_sig = Script::new()
            .push_data(&signature)
            .push_data(&key_pair.public_key.serialize());
        self.inputs[input_index].script_sig = script_sig;
        Ok(())
    }

    /// Total value of all outputs; `None` on overflow
    pub fn output_value(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }
}

/// Verify a P2PKH input signature (used by the local ledger and tests)
pub fn verify_p2pkh_input(
    tx: &Transaction,
    input_index: usize,
    value: u64,
) -> Result<bool, TransactionError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(TransactionError::InputOutOfRange(input_index))?;
    let ins = input.script_sig.instructions()?;
    let (sig, key) = match ins.as_slice() {
        [Instruction::Push(sig), Instruction::Push(key)] if !sig.is_empty() => (sig, key),
        _ => return Ok(false),
    };

    let public_key = public_key_from_hex(&hex::encode(key))?;
    let (der, sighash) = match split_signature(sig) {
        Some(parts) => parts,
        None => return Ok(false),
    };

    let script_code = Script::for_address(&public_key_to_address(&public_key))?;
    let digest = tx.signature_digest(input_index, &script_code, value, sighash)?;
    Ok(crate::crypto::verify_signature(&public_key, &digest, der)?)
}

/// Parsed `OP_M <pubkey>... OP_N OP_CHECKMULTISIG` redeem script
pub fn parse_multisig(redeem: &Script) -> Option<(usize, Vec<Vec<u8>>)> {
    let ins = redeem.instructions().ok()?;
    let (first, rest) = ins.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (total_op, keys) = rest.split_last()?;
    if !last.is_op(OpCode::CheckMultiSig) {
        return None;
    }
    let threshold = small_int(first)?;
    let total = small_int(total_op)?;
    let keys: Vec<Vec<u8>> = keys.iter().filter_map(|i| i.data().map(<[u8]>::to_vec)).collect();
    if keys.len() != total || threshold == 0 || threshold > total {
        return None;
    }
    Some((threshold, keys))
}

fn small_int(ins: &Instruction) -> Option<usize> {
    match ins {
        Instruction::Op(b) if (OpCode::Op1.to_byte()..=OpCode::Op16.to_byte()).contains(b) => {
            Some((b - OpCode::Op1.to_byte() + 1) as usize)
        }
        _ => None,
    }
}

/// Split a DER signature from its trailing sighash byte
fn split_signature(sig: &[u8]) -> Option<(&[u8], SigHashType)> {
    let (hash_byte, der) = sig.split_last()?;
    Some((der, SigHashType::from_byte(*hash_byte)?))
}

/// Verify a P2SH multisig input (`OP_0 <sig>... <redeem>`)
///
/// Signatures must appear in the same relative order as their keys in the
/// redeem script, exactly as OP_CHECKMULTISIG consumes them.
pub fn verify_multisig_input(
    tx: &Transaction,
    input_index: usize,
    value: u64,
    script_pubkey: &Script,
) -> Result<bool, TransactionError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(TransactionError::InputOutOfRange(input_index))?;
    let ins = input.script_sig.instructions()?;
    let (dummy, rest) = match ins.split_first() {
        Some(split) => split,
        None => return Ok(false),
    };
    let (redeem, sigs) = match rest.split_last() {
        Some((Instruction::Push(redeem), sigs)) => (Script::from_bytes(redeem.clone()), sigs),
        _ => return Ok(false),
    };
    if dummy.data().map_or(true, |d| !d.is_empty()) || redeem.to_p2sh() != *script_pubkey {
        return Ok(false);
    }

    let (threshold, keys) = match parse_multisig(&redeem) {
        Some(parsed) => parsed,
        None => return Ok(false),
    };
    if sigs.len() != threshold {
        return Ok(false);
    }

    let mut key_iter = keys.iter();
    for sig in sigs {
        let (der, sighash) = match sig.data().and_then(split_signature) {
            Some(parts) => parts,
            None => return Ok(false),
        };
        let digest = tx.signature_digest(input_index, &redeem, value, sighash)?;
        let mut matched = false;
        for key in key_iter.by_ref() {
            let public_key = public_key_from_hex(&hex::encode(key))?;
            if crate::crypto::verify_signature(&public_key, &digest, der)? {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Verify any supported input against the output it spends
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    value: u64,
    script_pubkey: &Script,
) -> Result<bool, TransactionError> {
    let address = match script_pubkey.address() {
        Some(address) => address,
        None => return Ok(false),
    };
    let (version, _) = crate::crypto::address_to_hash160(&address)?;
    if version == crate::crypto::P2SH_VERSION {
        return verify_multisig_input(tx, input_index, value, script_pubkey);
    }

    let spender = tx.inputs[input_index].spender_address();
    Ok(spender.as_deref() == Some(address.as_str()) && verify_p2pkh_input(tx, input_index, value)?)
}
