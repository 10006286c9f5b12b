//! External collaborators
//!
//! The coordination core talks to the outside world only through these
//! traits: a ledger for UTXOs and broadcast, a token registry, a blob store
//! and a pub/sub relay. `LocalNetwork` implements all four in-process.

pub mod local;
pub mod retry;

pub use local::LocalNetwork;
pub use retry::{with_backoff, with_timeout, RetryPolicy, Retryable};

use crate::core::OutPoint;
use crate::relay::nostr::NostrEvent;
use crate::token::TokenData;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Failures reported by external services
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected as conflicting: {0}")]
    Conflict(String),
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl ServiceError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Unavailable(_))
    }
}

// =============================================================================
// Ledger data
// =============================================================================

/// Unspent output owned by an address
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// Output script of the unspent output
    pub script_hex: String,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }
}

/// Input as reported by the ledger
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxDataInput {
    pub txid: String,
    pub vout: u32,
    /// Address that owned the spent output
    pub address: Option<String>,
}

/// Output as reported by the ledger
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxDataOutput {
    pub value: u64,
    pub script_hex: String,
}

/// Decoded transaction as reported by the ledger
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxData {
    pub txid: String,
    pub vin: Vec<TxDataInput>,
    pub vout: Vec<TxDataOutput>,
}

impl TxData {
    /// Originating address of the first input
    pub fn sender(&self) -> Option<&str> {
        self.vin.first().and_then(|i| i.address.as_deref())
    }
}

// =============================================================================
// Service traits
// =============================================================================

#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ServiceError>;

    /// Public key revealed on-chain by `address`; `NotFound` if it never spent
    async fn get_public_key(&self, address: &str) -> Result<String, ServiceError>;

    async fn get_transaction(&self, txid: &str) -> Result<TxData, ServiceError>;

    /// Broadcast raw transaction hex, returning the txid
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait TokenRegistry: Send + Sync {
    async fn get_token_data(&self, token_id: &str) -> Result<TokenData, ServiceError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an opaque payload under an application id, returning its handle
    async fn put(&self, payload: &str, app_id: &str) -> Result<String, ServiceError>;

    async fn get(&self, handle: &str) -> Result<String, ServiceError>;

    /// Pin a stored payload, returning a durable content id
    async fn pin(&self, handle: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait PubSubRelay: Send + Sync {
    /// Publish a signed event, returning its id
    async fn publish(&self, event: &NostrEvent) -> Result<String, ServiceError>;

    /// First event matching `event_id`
    async fn fetch_event(&self, event_id: &str) -> Result<NostrEvent, ServiceError>;
}

/// Handles to every external collaborator
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn LedgerService>,
    pub registry: Arc<dyn TokenRegistry>,
    pub blobs: Arc<dyn BlobStore>,
    pub pubsub: Arc<dyn PubSubRelay>,
}

impl Services {
    /// Every service backed by one in-process network
    pub fn local(network: Arc<LocalNetwork>) -> Self {
        Self {
            ledger: network.clone(),
            registry: network.clone(),
            blobs: network.clone(),
            pubsub: network,
        }
    }

    /// Replace the pub/sub relay, e.g. with a websocket client
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSubRelay>) -> Self {
        self.pubsub = pubsub;
        self
    }
}
