//! Toolkit configuration
//!
//! Stored as `config.json` in the data directory. CLI flags override the
//! stored values; the resulting `Config` is handed to `Toolkit::new` by value.

use crate::core::{FeeRate, DEFAULT_FEE_RATE, DUST_LIMIT};
use crate::multisig::SignaturePolicy;
use crate::relay::{Channel, RelaySettings};
use crate::services::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Application id blobs are stored under
    pub app_id: String,
    /// Group token whose NFT holders form the multisig
    pub group_id: Option<String>,
    /// sat/byte
    pub fee_rate: u64,
    /// Value of each signal output
    pub dust_amount: u64,
    /// Value paid by a price-update commitment
    pub spend_amount: u64,
    pub request_timeout_ms: u64,
    /// Backoff while waiting for a spent UTXO to settle
    pub settle: RetryPolicy,
    pub signature_policy: SignaturePolicy,
    pub channel: Channel,
    pub nostr_relay_url: String,
    pub write_price_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".msrelay_data"),
            app_id: "psf-bch-wallet".to_string(),
            group_id: None,
            fee_rate: DEFAULT_FEE_RATE,
            dust_amount: DUST_LIMIT,
            spend_amount: 1_000,
            request_timeout_ms: 30_000,
            settle: RetryPolicy::default(),
            signature_policy: SignaturePolicy::default(),
            channel: Channel::default(),
            nostr_relay_url: "ws://127.0.0.1:7000".to_string(),
            write_price_address: None,
        }
    }
}

impl Config {
    /// Load `config.json` from `data_dir`, falling back to defaults
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            log::debug!("No config at {:?}, using defaults", path);
            Config::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Write to `data_dir/config.json` through a temporary file
    pub fn save(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.data_dir)?;
        let temp_path = self.data_dir.join("config.tmp");
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, self)?;
        fs::rename(&temp_path, self.data_dir.join(CONFIG_FILE))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_byte(self.fee_rate)
    }

    pub fn wallets_dir(&self) -> PathBuf {
        self.data_dir.join("wallets")
    }

    pub fn rounds_dir(&self) -> PathBuf {
        self.data_dir.join("rounds")
    }

    /// State file of the in-process devnet
    pub fn network_path(&self) -> PathBuf {
        self.data_dir.join("network.json")
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            app_id: self.app_id.clone(),
            fee_rate: self.fee_rate(),
            signal_amount: self.dust_amount,
            settle: self.settle.clone(),
            timeout: self.request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fee_rate, 3);
        assert_eq!(config.dust_amount, 546);
        assert_eq!(config.spend_amount, 1_000);
        assert_eq!(config.signature_policy, SignaturePolicy::ArrivalOrder);
        assert_eq!(config.relay_settings().signal_amount, 546);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.app_id, "psf-bch-wallet");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = Config::load(dir.path()).unwrap();
        config.group_id = Some("group".to_string());
        config.channel = Channel::Nostr;
        config.signature_policy = SignaturePolicy::KeyOrder;
        config.save().unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"fee_rate": 5}"#).unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.fee_rate, 5);
        assert_eq!(config.dust_amount, DUST_LIMIT);
        assert_eq!(config.fee_rate(), FeeRate::from_sat_per_byte(5));
    }
}
