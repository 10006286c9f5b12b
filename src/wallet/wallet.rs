//! Local signing wallets
//!
//! Each participant holds a single-key wallet: its key signs multisig
//! inputs, decrypts relayed payloads, and funds signal transactions.

use crate::core::{
    estimate_tx_size, p2pkh_input_size, FeeRate, OutPoint, Script, Transaction, TransactionError,
    TxInput, TxOutput, DUST_LIMIT,
};
use crate::crypto::KeyPair;
use crate::services::Utxo;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Wallet not found: {0}")]
    NotFound(String),
    #[error("Wallet already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid wallet name: {0}")]
    InvalidName(String),
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
    #[error("Script error: {0}")]
    ScriptError(#[from] crate::core::ScriptError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] crate::crypto::KeyError),
}

/// Serializable wallet data for persistence
#[derive(Debug, Serialize, Deserialize)]
struct WalletData {
    name: String,
    private_key_hex: String,
    address: String,
    public_key: String,
}

/// A named single-key wallet
pub struct Wallet {
    pub name: String,
    key_pair: KeyPair,
}

impl Wallet {
    /// Create a new wallet with a fresh key pair
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key_pair: KeyPair::generate(),
        }
    }

    /// Import a wallet from a private key
    pub fn from_private_key(name: &str, private_key_hex: &str) -> Result<Self, WalletError> {
        Ok(Self {
            name: name.to_string(),
            key_pair: KeyPair::from_private_key_hex(private_key_hex)?,
        })
    }

    /// Get the wallet's address
    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    /// Get the wallet's public key (hex)
    pub fn public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Build and sign a P2PKH spend paying `outputs`, largest UTXOs first
    ///
    /// Change above the dust limit returns to this wallet.
    pub fn build_transaction(
        &self,
        utxos: &[Utxo],
        outputs: Vec<TxOutput>,
        fee_rate: FeeRate,
    ) -> Result<Transaction, WalletError> {
        let mut sorted: Vec<&Utxo> = utxos.iter().collect();
        sorted.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.txid.cmp(&b.txid))
                .then_with(|| a.vout.cmp(&b.vout))
        });

        let change_script = Script::for_address(&self.address())?;
        let amount = outputs.iter().fold(0u64, |acc, o| acc.saturating_add(o.value));
        let mut sized = outputs.clone();
        sized.push(TxOutput::new(0, change_script.clone()));

        let mut selected = Vec::new();
        let mut selected_value = 0u64;
        let mut need = amount;
        for utxo in sorted {
            selected.push(utxo);
            selected_value = selected_value.saturating_add(utxo.value);
            let input_sizes = vec![p2pkh_input_size(); selected.len()];
            need = amount.saturating_add(fee_rate.fee_for_size(estimate_tx_size(&input_sizes, &sized)));
            if selected_value >= need {
                break;
            }
        }
        if selected_value < need || selected.is_empty() {
            let input_sizes = vec![p2pkh_input_size(); selected.len().max(1)];
            return Err(WalletError::InsufficientFunds {
                have: selected_value,
                need: amount.saturating_add(fee_rate.fee_for_size(estimate_tx_size(&input_sizes, &sized))),
            });
        }

        let mut outputs = outputs;
        let change = selected_value - need;
        if change >= DUST_LIMIT {
            outputs.push(TxOutput::new(change, change_script));
        }

        let inputs = selected
            .iter()
            .map(|u| TxInput::new(OutPoint::new(u.txid.clone(), u.vout)))
            .collect();
        let mut tx = Transaction::new(inputs, outputs);
        for (index, utxo) in selected.iter().enumerate() {
            tx.sign_p2pkh_input(index, &self.key_pair, utxo.value)?;
        }
        Ok(tx)
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let data = WalletData {
            name: self.name.clone(),
            private_key_hex: self.key_pair.private_key_hex(),
            address: self.address(),
            public_key: self.public_key(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;
        Self::from_private_key(&data.name, &data.private_key_hex)
    }

    /// Export wallet info (without private key)
    pub fn export_public_info(&self) -> WalletInfo {
        WalletInfo {
            name: self.name.clone(),
            address: self.address(),
            public_key: self.public_key(),
        }
    }
}

/// Public wallet information (safe to share)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletInfo {
    pub name: String,
    pub address: String,
    pub public_key: String,
}

/// Wallet manager storing `<name>.json` files
pub struct WalletManager {
    wallets_dir: PathBuf,
}

impl WalletManager {
    /// Create a new wallet manager
    pub fn new(wallets_dir: &Path) -> Result<Self, WalletError> {
        fs::create_dir_all(wallets_dir)?;
        Ok(Self {
            wallets_dir: wallets_dir.to_path_buf(),
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, WalletError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WalletError::InvalidName(name.to_string()));
        }
        Ok(self.wallets_dir.join(format!("{}.json", name)))
    }

    /// Create and save a new wallet
    pub fn create_wallet(&self, name: &str) -> Result<Wallet, WalletError> {
        self.store(Wallet::new(name))
    }

    /// Import and save a wallet from a private key
    pub fn import_wallet(&self, name: &str, private_key_hex: &str) -> Result<Wallet, WalletError> {
        self.store(Wallet::from_private_key(name, private_key_hex)?)
    }

    fn store(&self, wallet: Wallet) -> Result<Wallet, WalletError> {
        let path = self.path_for(&wallet.name)?;
        if path.exists() {
            return Err(WalletError::AlreadyExists(wallet.name));
        }
        wallet.save(&path)?;
        log::info!("Created wallet '{}' ({})", wallet.name, wallet.address());
        Ok(wallet)
    }

    /// List all wallets, sorted by name
    pub fn list_wallets(&self) -> Result<Vec<WalletInfo>, WalletError> {
        let mut wallets = Vec::new();

        for entry in fs::read_dir(&self.wallets_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(wallet) = Wallet::load(&path) {
                    wallets.push(wallet.export_public_info());
                }
            }
        }

        wallets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(wallets)
    }

    /// Load a specific wallet by name
    pub fn load_wallet(&self, name: &str) -> Result<Wallet, WalletError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(WalletError::NotFound(name.to_string()));
        }
        Wallet::load(&path)
    }

    /// Delete a wallet
    pub fn delete_wallet(&self, name: &str) -> Result<(), WalletError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(WalletError::NotFound(name.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::verify_p2pkh_input;

    fn utxo(byte: u8, value: u64) -> Utxo {
        Utxo {
            txid: hex::encode([byte; 32]),
            vout: 0,
            value,
            script_hex: String::new(),
        }
    }

    #[test]
    fn test_wallet_import() {
        let wallet1 = Wallet::new("alice");
        let wallet2 = Wallet::from_private_key("copy", &wallet1.key_pair().private_key_hex()).unwrap();
        assert_eq!(wallet1.address(), wallet2.address());
    }

    #[test]
    fn test_wallet_save_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test_wallet.json");

        let wallet1 = Wallet::new("bob");
        wallet1.save(&path).unwrap();

        let wallet2 = Wallet::load(&path).unwrap();
        assert_eq!(wallet1.address(), wallet2.address());
        assert_eq!(wallet2.name, "bob");
    }

    #[test]
    fn test_manager_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = WalletManager::new(temp_dir.path()).unwrap();

        let carol = manager.create_wallet("carol").unwrap();
        manager.create_wallet("alice").unwrap();
        assert!(matches!(
            manager.create_wallet("carol"),
            Err(WalletError::AlreadyExists(_))
        ));
        assert!(matches!(
            manager.create_wallet("../evil"),
            Err(WalletError::InvalidName(_))
        ));

        let names: Vec<String> = manager.list_wallets().unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["alice", "carol"]);
        assert_eq!(manager.load_wallet("carol").unwrap().address(), carol.address());

        manager.delete_wallet("carol").unwrap();
        assert!(matches!(manager.load_wallet("carol"), Err(WalletError::NotFound(_))));
    }

    #[test]
    fn test_transaction_creation() {
        let wallet = Wallet::new("payer");
        let recipient = Wallet::new("payee").address();
        let utxos = vec![utxo(1, 800), utxo(2, 5_000)];
        let outputs = vec![TxOutput::new(1_000, Script::for_address(&recipient).unwrap())];

        let tx = wallet.build_transaction(&utxos, outputs, FeeRate::default()).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].previous_output.txid, hex::encode([2u8; 32]));
        assert_eq!(tx.outputs.len(), 2);
        assert!(verify_p2pkh_input(&tx, 0, 5_000).unwrap());
    }

    #[test]
    fn test_multiple_inputs_and_shortfall() {
        let wallet = Wallet::new("payer");
        let recipient = Script::for_address(&Wallet::new("payee").address()).unwrap();
        let utxos = vec![utxo(1, 2_000), utxo(2, 2_000)];

        let tx = wallet
            .build_transaction(&utxos, vec![TxOutput::new(2_500, recipient.clone())], FeeRate::default())
            .unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert!(verify_p2pkh_input(&tx, 1, 2_000).unwrap());

        let result = wallet.build_transaction(&utxos, vec![TxOutput::new(4_000, recipient)], FeeRate::default());
        assert!(matches!(result, Err(WalletError::InsufficientFunds { have: 4_000, .. })));
    }
}
