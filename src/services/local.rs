//! In-process network
//!
//! A single-node ledger, token registry, blob store and pub/sub relay kept
//! in memory and optionally mirrored to a JSON file, so that independent CLI
//! invocations (one per participant) share the same view.

use crate::core::{verify_input, Script, Transaction};
use crate::crypto::{sha256, sha256_hex};
use crate::relay::nostr::NostrEvent;
use crate::services::{
    BlobStore, LedgerService, PubSubRelay, ServiceError, TokenRegistry, TxData, TxDataInput,
    TxDataOutput, Utxo,
};
use crate::token::TokenData;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Stored blob
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlobEntry {
    app_id: String,
    payload: String,
}

/// Everything the network remembers
#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkState {
    /// address -> unspent outputs
    utxos: BTreeMap<String, Vec<Utxo>>,
    /// "txid:vout" of every spent output
    spent: BTreeSet<String>,
    /// address -> public key revealed by a spend
    public_keys: BTreeMap<String, String>,
    transactions: BTreeMap<String, TxData>,
    tokens: BTreeMap<String, TokenData>,
    blobs: BTreeMap<String, BlobEntry>,
    /// content id -> blob handle
    pins: BTreeMap<String, String>,
    events: BTreeMap<String, NostrEvent>,
    /// Counter feeding synthetic funding txids
    faucet_nonce: u64,
    /// Stale UTXO view served while a broadcast settles
    #[serde(skip)]
    stale_view: Option<(u32, BTreeMap<String, Vec<Utxo>>)>,
}

/// In-process implementation of every external service
#[derive(Debug, Default)]
pub struct LocalNetwork {
    state: Mutex<NetworkState>,
    path: Option<PathBuf>,
    /// UTXO queries answered from the pre-broadcast view after each broadcast
    settle_lag: u32,
}

fn outpoint_key(txid: &str, vout: u32) -> String {
    format!("{}:{}", txid, vout)
}

/// CIDv0 of a payload: base58 of the sha2-256 multihash
pub fn content_id(payload: &[u8]) -> String {
    let mut multihash = vec![0x12, 0x20];
    multihash.extend_from_slice(&sha256(payload));
    bs58::encode(multihash).into_string()
}

impl LocalNetwork {
    /// Empty network held only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a network persisted at `path`, creating it if missing
    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        let state = if path.exists() {
            let json = fs::read_to_string(path)
                .map_err(|e| ServiceError::Unavailable(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str(&json)
                .map_err(|e| ServiceError::Invalid(format!("{}: {}", path.display(), e)))?
        } else {
            NetworkState::default()
        };

        log::debug!("Opened local network at {}", path.display());
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
            settle_lag: 0,
        })
    }

    /// Serve `queries` stale UTXO answers after every broadcast
    pub fn with_settle_lag(mut self, queries: u32) -> Self {
        self.settle_lag = queries;
        self
    }

    fn with_state<T>(
        &self,
        mutate: bool,
        f: impl FnOnce(&mut NetworkState) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ServiceError::Unavailable("network state lock poisoned".to_string()))?;
        let out = f(&mut state)?;
        if mutate {
            if let Some(path) = &self.path {
                let json = serde_json::to_string_pretty(&*state)
                    .map_err(|e| ServiceError::Invalid(e.to_string()))?;
                fs::write(path, json)
                    .map_err(|e| ServiceError::Unavailable(format!("{}: {}", path.display(), e)))?;
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Devnet helpers
    // =========================================================================

    /// Credit `value` to `address` out of thin air, returning the funding txid
    pub fn fund(&self, address: &str, value: u64) -> Result<String, ServiceError> {
        let script = Script::for_address(address).map_err(|e| ServiceError::Invalid(e.to_string()))?;
        self.with_state(true, |state| {
            state.faucet_nonce += 1;
            let txid = sha256_hex(format!("faucet:{}:{}", address, state.faucet_nonce).as_bytes());
            let utxo = Utxo {
                txid: txid.clone(),
                vout: 0,
                value,
                script_hex: script.to_hex(),
            };
            state.utxos.entry(address.to_string()).or_default().push(utxo);
            state.transactions.insert(
                txid.clone(),
                TxData {
                    txid: txid.clone(),
                    vin: Vec::new(),
                    vout: vec![TxDataOutput {
                        value,
                        script_hex: script.to_hex(),
                    }],
                },
            );
            log::info!("Funded {} with {} sat ({})", address, value, txid);
            Ok(txid)
        })
    }

    /// Add or replace a token record
    pub fn register_token(&self, token: TokenData) -> Result<(), ServiceError> {
        self.with_state(true, |state| {
            log::info!("Registered token {}", token.token_id);
            state.tokens.insert(token.token_id.clone(), token);
            Ok(())
        })
    }

    /// Record a public key as if `address` had already spent on-chain
    pub fn reveal_public_key(&self, address: &str, public_key_hex: &str) -> Result<(), ServiceError> {
        self.with_state(true, |state| {
            state
                .public_keys
                .insert(address.to_string(), public_key_hex.to_string());
            Ok(())
        })
    }

    /// Confirmed balance of an address
    pub fn balance(&self, address: &str) -> Result<u64, ServiceError> {
        self.with_state(false, |state| {
            Ok(state
                .utxos
                .get(address)
                .map(|u| u.iter().map(|x| x.value).sum())
                .unwrap_or(0))
        })
    }

    /// Number of broadcast transactions that spent at least one input
    pub fn broadcast_count(&self) -> Result<usize, ServiceError> {
        self.with_state(false, |state| {
            Ok(state.transactions.values().filter(|t| !t.vin.is_empty()).count())
        })
    }

    fn apply_transaction(state: &mut NetworkState, tx: &Transaction) -> Result<String, ServiceError> {
        let txid = tx.txid().map_err(|e| ServiceError::Invalid(e.to_string()))?;
        if state.transactions.contains_key(&txid) {
            return Ok(txid);
        }

        // Resolve and verify every input before touching state
        let mut spent = Vec::with_capacity(tx.inputs.len());
        let mut seen = BTreeSet::new();
        for (index, input) in tx.inputs.iter().enumerate() {
            let prev = &input.previous_output;
            let key = outpoint_key(&prev.txid, prev.vout);
            if state.spent.contains(&key) {
                return Err(ServiceError::Conflict(format!("{} already spent", key)));
            }
            if !seen.insert(key.clone()) {
                return Err(ServiceError::Conflict(format!("{} spent twice in one transaction", key)));
            }
            let (address, utxo) = state
                .utxos
                .iter()
                .find_map(|(addr, list)| {
                    list.iter()
                        .find(|u| u.txid == prev.txid && u.vout == prev.vout)
                        .map(|u| (addr.clone(), u.clone()))
                })
                .ok_or_else(|| ServiceError::Invalid(format!("unknown input {}", key)))?;

            let script = Script::from_hex(&utxo.script_hex)
                .map_err(|e| ServiceError::Invalid(e.to_string()))?;
            let valid = verify_input(tx, index, utxo.value, &script)
                .map_err(|e| ServiceError::Invalid(e.to_string()))?;
            if !valid {
                return Err(ServiceError::Invalid(format!("input {} fails verification", index)));
            }
            spent.push((key, address, utxo, input.revealed_public_key()));
        }

        let input_value = spent
            .iter()
            .try_fold(0u64, |acc, (_, _, u, _)| acc.checked_add(u.value))
            .ok_or_else(|| ServiceError::Invalid("input value overflow".to_string()))?;
        let output_value = tx
            .output_value()
            .ok_or_else(|| ServiceError::Invalid("output value overflow".to_string()))?;
        if output_value > input_value {
            return Err(ServiceError::Invalid(format!(
                "outputs {} exceed inputs {}",
                output_value, input_value
            )));
        }

        let mut vin = Vec::with_capacity(spent.len());
        for (key, address, utxo, revealed) in spent {
            if let Some(list) = state.utxos.get_mut(&address) {
                list.retain(|u| !(u.txid == utxo.txid && u.vout == utxo.vout));
            }
            state.spent.insert(key);
            if let Some(pk) = revealed {
                state
                    .public_keys
                    .entry(address.clone())
                    .or_insert_with(|| hex::encode(pk.serialize()));
            }
            vin.push(TxDataInput {
                txid: utxo.txid,
                vout: utxo.vout,
                address: Some(address),
            });
        }

        let mut vout = Vec::with_capacity(tx.outputs.len());
        for (index, output) in tx.outputs.iter().enumerate() {
            if let Some(address) = output.script_pubkey.address() {
                state.utxos.entry(address).or_default().push(Utxo {
                    txid: txid.clone(),
                    vout: index as u32,
                    value: output.value,
                    script_hex: output.script_pubkey.to_hex(),
                });
            }
            vout.push(TxDataOutput {
                value: output.value,
                script_hex: output.script_pubkey.to_hex(),
            });
        }

        state.transactions.insert(
            txid.clone(),
            TxData {
                txid: txid.clone(),
                vin,
                vout,
            },
        );
        Ok(txid)
    }
}

#[async_trait]
impl LedgerService for LocalNetwork {
    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ServiceError> {
        self.with_state(false, |state| {
            if let Some((remaining, view)) = state.stale_view.as_mut() {
                let utxos = view.get(address).cloned().unwrap_or_default();
                *remaining -= 1;
                if *remaining == 0 {
                    state.stale_view = None;
                }
                return Ok(utxos);
            }
            Ok(state.utxos.get(address).cloned().unwrap_or_default())
        })
    }

    async fn get_public_key(&self, address: &str) -> Result<String, ServiceError> {
        self.with_state(false, |state| {
            state
                .public_keys
                .get(address)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("no public key for {}", address)))
        })
    }

    async fn get_transaction(&self, txid: &str) -> Result<TxData, ServiceError> {
        self.with_state(false, |state| {
            state
                .transactions
                .get(txid)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", txid)))
        })
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ServiceError> {
        let tx = Transaction::from_hex(raw_tx_hex).map_err(|e| ServiceError::Invalid(e.to_string()))?;
        let lag = self.settle_lag;
        self.with_state(true, |state| {
            let before = state.utxos.clone();
            let txid = Self::apply_transaction(state, &tx)?;
            if lag > 0 {
                state.stale_view = Some((lag, before));
            }
            log::debug!("Accepted transaction {}", txid);
            Ok(txid)
        })
    }
}

#[async_trait]
impl TokenRegistry for LocalNetwork {
    async fn get_token_data(&self, token_id: &str) -> Result<TokenData, ServiceError> {
        self.with_state(false, |state| {
            state
                .tokens
                .get(token_id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("token {}", token_id)))
        })
    }
}

#[async_trait]
impl BlobStore for LocalNetwork {
    async fn put(&self, payload: &str, app_id: &str) -> Result<String, ServiceError> {
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let handle = sha256_hex(format!("{}:{}:{}", app_id, stamp, payload).as_bytes());
        self.with_state(true, |state| {
            state.blobs.insert(
                handle.clone(),
                BlobEntry {
                    app_id: app_id.to_string(),
                    payload: payload.to_string(),
                },
            );
            Ok(handle)
        })
    }

    async fn get(&self, handle: &str) -> Result<String, ServiceError> {
        self.with_state(false, |state| {
            let key = state.pins.get(handle).map(String::as_str).unwrap_or(handle);
            state
                .blobs
                .get(key)
                .map(|b| b.payload.clone())
                .ok_or_else(|| ServiceError::NotFound(format!("blob {}", handle)))
        })
    }

    async fn pin(&self, handle: &str) -> Result<String, ServiceError> {
        self.with_state(true, |state| {
            let blob = state
                .blobs
                .get(handle)
                .ok_or_else(|| ServiceError::NotFound(format!("blob {}", handle)))?;
            let cid = content_id(blob.payload.as_bytes());
            log::debug!("Pinned {} ({}) as {}", handle, blob.app_id, cid);
            state.pins.insert(cid.clone(), handle.to_string());
            Ok(cid)
        })
    }
}

#[async_trait]
impl PubSubRelay for LocalNetwork {
    async fn publish(&self, event: &NostrEvent) -> Result<String, ServiceError> {
        if !event.verify() {
            return Err(ServiceError::Invalid(format!("bad event signature {}", event.id)));
        }
        self.with_state(true, |state| {
            state.events.insert(event.id.clone(), event.clone());
            Ok(event.id.clone())
        })
    }

    async fn fetch_event(&self, event_id: &str) -> Result<NostrEvent, ServiceError> {
        self.with_state(false, |state| {
            state
                .events
                .get(event_id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("event {}", event_id)))
        })
    }
}
