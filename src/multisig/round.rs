//! Coordination round bookkeeping
//!
//! The initiator's view of one round, persisted between CLI invocations so
//! `propose` and `finish` can run as separate processes.

use crate::multisig::transaction::UnsignedTransaction;
use crate::multisig::wallet::{HolderKey, MultisigError, ThresholdWallet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Stage of a coordination round
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    KeysCollected,
    WalletBuilt,
    TxComposed,
    FannedOut,
    ThresholdReached,
    Broadcast,
}

impl RoundState {
    /// Rounds only move forward one stage at a time
    pub fn can_advance_to(self, next: RoundState) -> bool {
        use RoundState::*;
        matches!(
            (self, next),
            (KeysCollected, WalletBuilt)
                | (WalletBuilt, TxComposed)
                | (TxComposed, FannedOut)
                | (FannedOut, ThresholdReached)
                | (ThresholdReached, Broadcast)
        )
    }
}

/// One holder the request was delivered to
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub address: String,
    pub signal_txid: String,
}

/// Persistent record of a round
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub state: RoundState,
    pub wallet: ThresholdWallet,
    pub tx: Option<UnsignedTransaction>,
    pub deliveries: Vec<Delivery>,
    pub broadcast_txid: Option<String>,
    /// Number of times the round restarted after a conflicting spend
    pub restarts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    /// Start a round from the collected holder keys and derive its wallet
    pub fn new(keys: &[HolderKey]) -> Result<Self, MultisigError> {
        let wallet = ThresholdWallet::build(keys)?;
        let now = Utc::now();
        let mut round = Self {
            id: String::new(),
            state: RoundState::KeysCollected,
            wallet,
            tx: None,
            deliveries: Vec::new(),
            broadcast_txid: None,
            restarts: 0,
            created_at: now,
            updated_at: now,
        };
        round.advance(RoundState::WalletBuilt)?;
        Ok(round)
    }

    /// Move to `next`, rejecting skips and backward moves
    pub fn advance(&mut self, next: RoundState) -> Result<(), MultisigError> {
        if !self.state.can_advance_to(next) {
            return Err(MultisigError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Round {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the composed transaction; its id becomes the round id
    pub fn composed(&mut self, tx: UnsignedTransaction) -> Result<(), MultisigError> {
        self.advance(RoundState::TxComposed)?;
        if self.id.is_empty() {
            self.id = tx.id()?;
        }
        self.tx = Some(tx);
        Ok(())
    }

    pub fn fanned_out(&mut self, deliveries: Vec<Delivery>) -> Result<(), MultisigError> {
        self.advance(RoundState::FannedOut)?;
        self.deliveries = deliveries;
        Ok(())
    }

    pub fn broadcast(&mut self, txid: &str) -> Result<(), MultisigError> {
        self.advance(RoundState::Broadcast)?;
        self.broadcast_txid = Some(txid.to_string());
        Ok(())
    }

    /// Drop the stale snapshot after a conflicting spend. The round falls back
    /// to `WalletBuilt`; composing again re-enters `TxComposed`.
    pub fn restart(&mut self) -> Result<(), MultisigError> {
        if self.state < RoundState::TxComposed || self.state == RoundState::Broadcast {
            return Err(MultisigError::InvalidTransition {
                from: self.state,
                to: RoundState::WalletBuilt,
            });
        }
        self.state = RoundState::WalletBuilt;
        self.tx = None;
        self.deliveries.clear();
        self.restarts += 1;
        self.updated_at = Utc::now();
        log::warn!("Round {} restarted ({} so far)", self.id, self.restarts);
        Ok(())
    }
}

/// Rounds stored as `<id>.json`
pub struct RoundStore {
    dir: PathBuf,
}

impl RoundStore {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn save(&self, round: &Round) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(round)?;
        fs::write(self.dir.join(format!("{}.json", round.id)), json)
    }

    pub fn load(&self, id: &str) -> std::io::Result<Round> {
        let json = fs::read_to_string(self.dir.join(format!("{}.json", id)))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Stored rounds, most recently updated first
    pub fn list(&self) -> std::io::Result<Vec<Round>> {
        let mut rounds = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(json) = fs::read_to_string(&path) {
                    if let Ok(round) = serde_json::from_str::<Round>(&json) {
                        rounds.push(round);
                    }
                }
            }
        }
        rounds.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rounds)
    }
}
