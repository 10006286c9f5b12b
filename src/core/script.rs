//! Script construction and decoding
//!
//! Builds the handful of output and redeem scripts the coordination flow
//! needs (P2PKH, P2SH, bare multisig redeem scripts, OP_RETURN data
//! carriers) and decodes any script back into its symbolic instructions so
//! embedded markers can be recovered.

use crate::crypto::{address_to_hash160, base58check_encode, hash160, P2PKH_VERSION, P2SH_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Script Constants
// =============================================================================

/// Largest number of keys a standard P2SH multisig redeem script may carry
pub const MAX_MULTISIG_KEYS: usize = 15;

/// Largest data-carrier script accepted by standard relay policy
pub const MAX_DATA_CARRIER_BYTES: usize = 223;

/// Largest script element that may be pushed
pub const MAX_PUSH_SIZE: usize = 520;

// =============================================================================
// Script Errors
// =============================================================================

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Push of {0} bytes runs past end of script")]
    TruncatedPush(usize),
    #[error("Invalid threshold: need {0} of {1} keys")]
    InvalidThreshold(usize, usize),
    #[error("Script too large: {0} bytes")]
    ScriptTooLarge(usize),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid script hex")]
    InvalidHex,
}

// =============================================================================
// Opcodes
// =============================================================================

/// The opcodes this crate emits or recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// Push an empty array
    Op0 = 0x00,
    /// Next byte holds the push length
    PushData1 = 0x4c,
    /// Next two bytes hold the push length
    PushData2 = 0x4d,
    /// Next four bytes hold the push length
    PushData4 = 0x4e,
    /// Push the number 1 (OP_2..OP_16 follow contiguously)
    Op1 = 0x51,
    Op16 = 0x60,
    /// Marks the output as provably unspendable
    Return = 0x6a,
    Dup = 0x76,
    Equal = 0x87,
    EqualVerify = 0x88,
    Hash160 = 0xa9,
    CheckSig = 0xac,
    CheckMultiSig = 0xae,
}

impl OpCode {
    /// Get the raw byte
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Name used in ASM output
    pub fn name(byte: u8) -> String {
        match byte {
            0x00 => "OP_0".to_string(),
            0x4c => "OP_PUSHDATA1".to_string(),
            0x4d => "OP_PUSHDATA2".to_string(),
            0x4e => "OP_PUSHDATA4".to_string(),
            0x4f => "OP_1NEGATE".to_string(),
            0x51..=0x60 => format!("OP_{}", byte - 0x50),
            0x6a => "OP_RETURN".to_string(),
            0x76 => "OP_DUP".to_string(),
            0x87 => "OP_EQUAL".to_string(),
            0x88 => "OP_EQUALVERIFY".to_string(),
            0xa9 => "OP_HASH160".to_string(),
            0xac => "OP_CHECKSIG".to_string(),
            0xae => "OP_CHECKMULTISIG".to_string(),
            other => format!("OP_UNKNOWN_{:#04x}", other),
        }
    }
}

/// Small integer opcode (OP_1..OP_16) for `n`
fn small_int_opcode(n: usize) -> Option<u8> {
    match n {
        1..=16 => Some(OpCode::Op1.to_byte() + (n as u8) - 1),
        _ => None,
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// A decoded script element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Data push (OP_0 decodes to an empty push)
    Push(Vec<u8>),
    /// Any non-push opcode, kept as its raw byte
    Op(u8),
}

impl Instruction {
    /// Pushed bytes, if this is a push
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Instruction::Push(data) => Some(data),
            Instruction::Op(_) => None,
        }
    }

    /// Whether this is the given opcode
    pub fn is_op(&self, op: OpCode) -> bool {
        matches!(self, Instruction::Op(b) if *b == op.to_byte())
    }
}

// =============================================================================
// Script
// =============================================================================

/// Raw script bytes with builder helpers
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, ScriptError> {
        hex::decode(hex_str)
            .map(Self)
            .map_err(|_| ScriptError::InvalidHex)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Append an opcode
    pub fn push_opcode(mut self, op: OpCode) -> Self {
        self.0.push(op.to_byte());
        self
    }

    /// Append a minimal data push
    pub fn push_data(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len == 0 {
            self.0.push(OpCode::Op0.to_byte());
            return self;
        }
        if len < OpCode::PushData1.to_byte() as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OpCode::PushData1.to_byte());
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OpCode::PushData2.to_byte());
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OpCode::PushData4.to_byte());
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OpCode::Dup)
            .push_opcode(OpCode::Hash160)
            .push_data(pubkey_hash)
            .push_opcode(OpCode::EqualVerify)
            .push_opcode(OpCode::CheckSig)
    }

    /// OP_HASH160 <20> OP_EQUAL
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OpCode::Hash160)
            .push_data(script_hash)
            .push_opcode(OpCode::Equal)
    }

    /// OP_M <pubkey>... OP_N OP_CHECKMULTISIG, keys kept in the given order
    pub fn multisig(threshold: usize, pubkeys: &[Vec<u8>]) -> Result<Self, ScriptError> {
        let total = pubkeys.len();
        if threshold == 0 || threshold > total || total > MAX_MULTISIG_KEYS {
            return Err(ScriptError::InvalidThreshold(threshold, total));
        }

        let mut script = Script::new();
        script.0.push(small_int_opcode(threshold).ok_or(ScriptError::InvalidThreshold(threshold, total))?);
        for key in pubkeys {
            script = script.push_data(key);
        }
        script.0.push(small_int_opcode(total).ok_or(ScriptError::InvalidThreshold(threshold, total))?);
        Ok(script.push_opcode(OpCode::CheckMultiSig))
    }

    /// OP_RETURN followed by one push per chunk
    pub fn data_carrier(chunks: &[&[u8]]) -> Result<Self, ScriptError> {
        let mut script = Script::new().push_opcode(OpCode::Return);
        for chunk in chunks {
            script = script.push_data(chunk);
        }
        if script.len() > MAX_DATA_CARRIER_BYTES {
            return Err(ScriptError::ScriptTooLarge(script.len()));
        }
        Ok(script)
    }

    /// Output script paying to a Base58Check address
    pub fn for_address(address: &str) -> Result<Self, ScriptError> {
        let (version, hash) = address_to_hash160(address)
            .map_err(|_| ScriptError::InvalidAddress(address.to_string()))?;
        match version {
            P2PKH_VERSION => Ok(Script::p2pkh(&hash)),
            P2SH_VERSION => Ok(Script::p2sh(&hash)),
            _ => Err(ScriptError::InvalidAddress(address.to_string())),
        }
    }

    /// P2SH address committing to this script
    pub fn p2sh_address(&self) -> String {
        base58check_encode(P2SH_VERSION, &hash160(&self.0))
    }

    /// P2SH output script committing to this script
    pub fn to_p2sh(&self) -> Script {
        Script::p2sh(&hash160(&self.0))
    }

    /// Whether this is an OP_RETURN output
    pub fn is_data_carrier(&self) -> bool {
        self.0.first() == Some(&OpCode::Return.to_byte())
    }

    /// Address paid by a P2PKH or P2SH output script
    pub fn address(&self) -> Option<String> {
        let b = &self.0;
        if b.len() == 25
            && b[0] == OpCode::Dup.to_byte()
            && b[1] == OpCode::Hash160.to_byte()
            && b[2] == 20
            && b[23] == OpCode::EqualVerify.to_byte()
            && b[24] == OpCode::CheckSig.to_byte()
        {
            return Some(base58check_encode(P2PKH_VERSION, &b[3..23]));
        }
        if b.len() == 23
            && b[0] == OpCode::Hash160.to_byte()
            && b[1] == 20
            && b[22] == OpCode::Equal.to_byte()
        {
            return Some(base58check_encode(P2SH_VERSION, &b[2..22]));
        }
        None
    }

    /// Decode the script into instructions
    pub fn instructions(&self) -> Result<Vec<Instruction>, ScriptError> {
        let b = &self.0;
        let mut out = Vec::new();
        let mut i = 0;

        while i < b.len() {
            let op = b[i];
            i += 1;

            let len = match op {
                0x00 => {
                    out.push(Instruction::Push(Vec::new()));
                    continue;
                }
                0x01..=0x4b => op as usize,
                0x4c => {
                    let n = *b.get(i).ok_or(ScriptError::TruncatedPush(1))? as usize;
                    i += 1;
                    n
                }
                0x4d => {
                    let bytes = b.get(i..i + 2).ok_or(ScriptError::TruncatedPush(2))?;
                    i += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                0x4e => {
                    let bytes = b.get(i..i + 4).ok_or(ScriptError::TruncatedPush(4))?;
                    i += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                _ => {
                    out.push(Instruction::Op(op));
                    continue;
                }
            };

            let end = i.checked_add(len).ok_or(ScriptError::TruncatedPush(len))?;
            let data = b.get(i..end).ok_or(ScriptError::TruncatedPush(len))?;
            out.push(Instruction::Push(data.to_vec()));
            i = end;
        }

        Ok(out)
    }

    /// Human-readable assembly, e.g. `OP_RETURN 6dd2 4d53...`
    pub fn to_asm(&self) -> Result<String, ScriptError> {
        let parts: Vec<String> = self
            .instructions()?
            .iter()
            .map(|ins| match ins {
                Instruction::Push(data) if data.is_empty() => "OP_0".to_string(),
                Instruction::Push(data) => hex::encode(data),
                Instruction::Op(byte) => OpCode::name(*byte),
            })
            .collect();
        Ok(parts.join(" "))
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// =============================================================================
// Signature Hash Types
// =============================================================================

/// Signature hash type appended to every signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SigHashType {
    /// Sign all inputs and all outputs
    All = 0x01,
    /// SIGHASH_ALL with the fork-id flag used on Bitcoin Cash
    #[default]
    AllForkId = 0x41,
}

impl SigHashType {
    /// Parse sighash type from byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SigHashType::All),
            0x41 => Some(SigHashType::AllForkId),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_p2pkh_address_roundtrip() {
        let kp = KeyPair::generate();
        let script = Script::for_address(&kp.address()).unwrap();
        assert_eq!(script.len(), 25);
        assert_eq!(script.address().unwrap(), kp.address());
    }

    #[test]
    fn test_multisig_layout_keeps_key_order() {
        let keys: Vec<Vec<u8>> = (0..3)
            .map(|_| KeyPair::generate().public_key.serialize().to_vec())
            .collect();
        let script = Script::multisig(2, &keys).unwrap();
        let ins = script.instructions().unwrap();

        assert_eq!(ins[0], Instruction::Op(0x52));
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(ins[i + 1].data().unwrap(), key.as_slice());
        }
        assert_eq!(ins[4], Instruction::Op(0x53));
        assert!(ins[5].is_op(OpCode::CheckMultiSig));
    }

    #[test]
    fn test_multisig_threshold_validation() {
        let keys = vec![vec![2u8; 33]; 3];
        assert!(Script::multisig(0, &keys).is_err());
        assert!(Script::multisig(4, &keys).is_err());
        assert!(Script::multisig(1, &vec![vec![2u8; 33]; 16]).is_err());
    }

    #[test]
    fn test_p2sh_address_starts_with_3() {
        let keys = vec![KeyPair::generate().public_key.serialize().to_vec()];
        let redeem = Script::multisig(1, &keys).unwrap();
        let address = redeem.p2sh_address();
        assert!(address.starts_with('3'));
        assert_eq!(redeem.to_p2sh().address().unwrap(), address);
    }

    #[test]
    fn test_data_carrier_decodes() {
        let script = Script::data_carrier(&[&[0x6d, 0xd2], b"MSG IPFS abc hi"]).unwrap();
        assert!(script.is_data_carrier());
        assert!(script.address().is_none());

        let ins = script.instructions().unwrap();
        assert!(ins[0].is_op(OpCode::Return));
        assert_eq!(ins[1].data().unwrap(), &[0x6d, 0xd2]);
        assert_eq!(ins[2].data().unwrap(), b"MSG IPFS abc hi");
        assert_eq!(
            script.to_asm().unwrap(),
            format!("OP_RETURN 6dd2 {}", hex::encode(b"MSG IPFS abc hi"))
        );
    }

    #[test]
    fn test_data_carrier_size_limit() {
        let big = vec![0u8; 300];
        assert!(matches!(
            Script::data_carrier(&[&big]),
            Err(ScriptError::ScriptTooLarge(_))
        ));
    }

    #[test]
    fn test_pushdata1_roundtrip() {
        let data = vec![7u8; 100];
        let script = Script::new().push_data(&data);
        assert_eq!(script.as_bytes()[0], 0x4c);
        assert_eq!(script.instructions().unwrap(), vec![Instruction::Push(data)]);
    }

    #[test]
    fn test_truncated_push_is_error() {
        let script = Script::from_bytes(vec![0x05, 0x01, 0x02]);
        assert_eq!(script.instructions(), Err(ScriptError::TruncatedPush(5)));
    }

    #[test]
    fn test_sighash_types() {
        assert_eq!(SigHashType::default(), SigHashType::AllForkId);
        assert_eq!(SigHashType::from_byte(0x41), Some(SigHashType::AllForkId));
        assert_eq!(SigHashType::from_byte(0x02), None);
    }
}
