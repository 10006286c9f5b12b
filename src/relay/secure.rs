//! End-to-end encrypted relay
//!
//! Payloads are encrypted to the recipient's public key and parked in the
//! blob store or on a Nostr relay; a dust transaction carrying a marker tells
//! the recipient where to look.

use crate::core::{FeeRate, OutPoint, Script, TxOutput, DUST_LIMIT};
use crate::crypto::{ecies, public_key_from_hex, CipherError};
use crate::relay::marker::{ContentPointer, Marker};
use crate::relay::nostr::NostrEvent;
use crate::services::{
    with_backoff, with_timeout, Retryable, RetryPolicy, ServiceError, Services,
};
use crate::wallet::{Wallet, WalletError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Cannot build signal: {0}")]
    SignalBuild(String),
    #[error("No message marker in transaction {0}")]
    MessageNotFound(String),
    #[error("Decryption failed: {0}")]
    Decryption(CipherError),
    #[error("Encryption failed: {0}")]
    Encryption(CipherError),
    #[error("Invalid recipient public key: {0}")]
    InvalidRecipient(String),
    #[error("Signal transaction {0} has no identifiable sender")]
    UnknownSender(String),
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("UTXO set has not settled")]
    NotSettled,
    #[error("Malformed payload: {0}")]
    Payload(String),
    #[error("Unexpected {0} message")]
    UnexpectedEnvelope(String),
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),
    #[error("Wallet error: {0}")]
    WalletError(WalletError),
}

impl From<WalletError> for RelayError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds { have, need } => RelayError::InsufficientFunds { have, need },
            other => RelayError::WalletError(other),
        }
    }
}

impl Retryable for RelayError {
    fn is_transient(&self) -> bool {
        match self {
            RelayError::NotSettled => true,
            // A stale view can hand back an output that was just spent
            RelayError::ServiceError(ServiceError::Conflict(_)) => true,
            RelayError::ServiceError(e) => e.is_transient(),
            _ => false,
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Where encrypted payloads are parked
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Blob,
    Nostr,
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blob" | "ipfs" | "p2wdb" => Ok(Channel::Blob),
            "nostr" => Ok(Channel::Nostr),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Blob store record: timestamp plus hex ciphertext
#[derive(Debug, Serialize, Deserialize)]
struct BlobRecord {
    now: String,
    data: String,
}

/// A broadcast signal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalTransaction {
    pub txid: String,
    pub recipient: String,
    pub marker: Marker,
}

/// A decrypted message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub sender: String,
    pub marker: Marker,
    pub payload: Vec<u8>,
}

/// Relay tuning
#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub app_id: String,
    pub fee_rate: FeeRate,
    /// Value paid to the recipient by each signal
    pub signal_amount: u64,
    pub settle: RetryPolicy,
    pub timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            app_id: "psf-bch-wallet".to_string(),
            fee_rate: FeeRate::default(),
            signal_amount: DUST_LIMIT,
            settle: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Secure Relay
// =============================================================================

/// Encrypted messaging bound to one local wallet
pub struct SecureRelay {
    wallet: Arc<Wallet>,
    services: Services,
    settings: RelaySettings,
    /// Outpoints this relay already spent, hidden from lagging UTXO views
    spent: Mutex<HashSet<OutPoint>>,
}

impl SecureRelay {
    pub fn new(wallet: Arc<Wallet>, services: Services, settings: RelaySettings) -> Self {
        Self {
            wallet,
            services,
            settings,
            spent: Mutex::new(HashSet::new()),
        }
    }

    pub fn address(&self) -> String {
        self.wallet.address()
    }

    /// Encrypt `payload` to `recipient_public_key` and park it on `channel`
    pub async fn send_encrypted(
        &self,
        recipient_public_key: &str,
        payload: &[u8],
        channel: Channel,
    ) -> Result<ContentPointer, RelayError> {
        let recipient = public_key_from_hex(recipient_public_key)
            .map_err(|_| RelayError::InvalidRecipient(recipient_public_key.to_string()))?;
        let ciphertext = ecies::encrypt_hex(&recipient, payload).map_err(RelayError::Encryption)?;

        let pointer = match channel {
            Channel::Blob => {
                let record = BlobRecord {
                    now: Utc::now().to_rfc3339(),
                    data: ciphertext,
                };
                let json = serde_json::to_string(&record).map_err(|e| RelayError::Payload(e.to_string()))?;
                let handle = with_timeout(
                    self.settings.timeout,
                    self.services.blobs.put(&json, &self.settings.app_id),
                )
                .await?;
                ContentPointer::Blob(handle)
            }
            Channel::Nostr => {
                let event = NostrEvent::text_note(&self.wallet.key_pair().secret_key, &ciphertext, Vec::new())?;
                let id = with_timeout(self.settings.timeout, self.services.pubsub.publish(&event)).await?;
                ContentPointer::Nostr(id)
            }
        };
        log::debug!("Stored encrypted payload for {} at {}", recipient_public_key, pointer);
        Ok(pointer)
    }

    /// Pay dust to `recipient_address` with a marker pointing at `pointer`
    ///
    /// Waits with backoff until the wallet's UTXO view no longer shows its
    /// own earlier spends.
    pub async fn signal(
        &self,
        recipient_address: &str,
        pointer: &ContentPointer,
        subject: &str,
    ) -> Result<SignalTransaction, RelayError> {
        let marker = Marker::new(pointer.clone(), subject);
        let outputs = vec![
            TxOutput::new(0, marker.to_script()?),
            TxOutput::new(
                self.settings.signal_amount,
                Script::for_address(recipient_address)
                    .map_err(|e| RelayError::SignalBuild(e.to_string()))?,
            ),
        ];

        let txid = self.broadcast_outputs(outputs).await?;
        log::info!("Signalled {} ({}) in {}", recipient_address, subject, txid);

        Ok(SignalTransaction {
            txid,
            recipient: recipient_address.to_string(),
            marker,
        })
    }

    /// Pay `outputs` from the local wallet once its UTXO view has settled
    pub async fn broadcast_outputs(&self, outputs: Vec<TxOutput>) -> Result<String, RelayError> {
        with_backoff(&self.settings.settle, || self.try_broadcast(outputs.clone())).await
    }

    /// One attempt: spend settled outputs only, remember what was spent
    async fn try_broadcast(&self, outputs: Vec<TxOutput>) -> Result<String, RelayError> {
        let own = self.wallet.address();
        let utxos = with_timeout(self.settings.timeout, self.services.ledger.get_utxos(&own)).await?;

        let fresh: Vec<_> = {
            let mut spent = self.spent_set()?;
            // Outpoints the ledger no longer lists have settled
            let listed: HashSet<OutPoint> = utxos.iter().map(|u| u.outpoint()).collect();
            spent.retain(|o| listed.contains(o));
            utxos.into_iter().filter(|u| !spent.contains(&u.outpoint())).collect()
        };
        if fresh.is_empty() {
            log::debug!("No settled UTXOs for {} yet", own);
            return Err(RelayError::NotSettled);
        }

        let tx = self.wallet.build_transaction(&fresh, outputs, self.settings.fee_rate)?;
        let raw = tx.to_hex().map_err(|e| RelayError::SignalBuild(e.to_string()))?;
        let txid = with_timeout(self.settings.timeout, self.services.ledger.broadcast(&raw)).await?;

        self.spent_set()?
            .extend(tx.inputs.iter().map(|i| i.previous_output.clone()));
        Ok(txid)
    }

    fn spent_set(&self) -> Result<std::sync::MutexGuard<'_, HashSet<OutPoint>>, RelayError> {
        self.spent
            .lock()
            .map_err(|_| RelayError::SignalBuild("spent set lock poisoned".to_string()))
    }

    /// Encrypt, store and signal in one step
    pub async fn send_message(
        &self,
        recipient_address: &str,
        recipient_public_key: &str,
        payload: &[u8],
        subject: &str,
        channel: Channel,
    ) -> Result<SignalTransaction, RelayError> {
        let pointer = self.send_encrypted(recipient_public_key, payload, channel).await?;
        self.signal(recipient_address, &pointer, subject).await
    }

    /// Read and decrypt the message a signal transaction points at
    pub async fn receive(&self, signal_txid: &str) -> Result<Received, RelayError> {
        let tx = with_timeout(self.settings.timeout, self.services.ledger.get_transaction(signal_txid)).await?;
        let sender = tx
            .sender()
            .ok_or_else(|| RelayError::UnknownSender(signal_txid.to_string()))?
            .to_string();

        let marker = tx
            .vout
            .iter()
            .filter_map(|o| Script::from_hex(&o.script_hex).ok())
            .find_map(|s| Marker::from_script(&s))
            .ok_or_else(|| RelayError::MessageNotFound(signal_txid.to_string()))?;

        let ciphertext = match &marker.pointer {
            ContentPointer::Blob(handle) => {
                let json = with_timeout(self.settings.timeout, self.services.blobs.get(handle)).await?;
                let record: BlobRecord =
                    serde_json::from_str(&json).map_err(|e| RelayError::Payload(e.to_string()))?;
                record.data
            }
            ContentPointer::Nostr(id) => {
                with_timeout(self.settings.timeout, self.services.pubsub.fetch_event(id))
                    .await?
                    .content
            }
        };

        let payload = ecies::decrypt_hex(&self.wallet.key_pair().secret_key, &ciphertext)
            .map_err(RelayError::Decryption)?;
        log::debug!("Received '{}' from {}", marker.subject, sender);

        Ok(Received {
            sender,
            marker,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::LocalNetwork;

    struct Net {
        network: Arc<LocalNetwork>,
        services: Services,
    }

    fn net(lag: u32) -> Net {
        let network = Arc::new(LocalNetwork::in_memory().with_settle_lag(lag));
        Net {
            services: Services::local(network.clone()),
            network,
        }
    }

    fn relay(net: &Net, name: &str) -> SecureRelay {
        let wallet = Arc::new(Wallet::new(name));
        net.network.fund(&wallet.address(), 100_000).unwrap();
        let settings = RelaySettings {
            settle: RetryPolicy::immediate(10),
            ..RelaySettings::default()
        };
        SecureRelay::new(wallet, net.services.clone(), settings)
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        for channel in [Channel::Blob, Channel::Nostr] {
            let net = net(0);
            let alice = relay(&net, "alice");
            let bob = relay(&net, "bob");

            let payload = b"\x00binary\xffpayload".to_vec();
            let signal = alice
                .send_message(&bob.address(), &bob.wallet.public_key(), &payload, "hello bob", channel)
                .await
                .unwrap();

            let received = bob.receive(&signal.txid).await.unwrap();
            assert_eq!(received.payload, payload);
            assert_eq!(received.sender, alice.address());
            assert_eq!(received.marker.subject, "hello bob");
        }
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_decrypt() {
        let net = net(0);
        let alice = relay(&net, "alice");
        let bob = relay(&net, "bob");
        let eve = relay(&net, "eve");

        let signal = alice
            .send_message(&bob.address(), &bob.wallet.public_key(), b"secret", "s", Channel::Blob)
            .await
            .unwrap();

        let result = eve.receive(&signal.txid).await;
        assert!(matches!(result, Err(RelayError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_missing_marker() {
        let net = net(0);
        let alice = relay(&net, "alice");
        let bob = relay(&net, "bob");

        // Plain payment without a marker
        let utxos = net.services.ledger.get_utxos(&alice.address()).await.unwrap();
        let out = TxOutput::new(1_000, Script::for_address(&bob.address()).unwrap());
        let tx = alice.wallet.build_transaction(&utxos, vec![out], FeeRate::default()).unwrap();
        let txid = net.services.ledger.broadcast(&tx.to_hex().unwrap()).await.unwrap();

        assert!(matches!(bob.receive(&txid).await, Err(RelayError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn test_signal_waits_for_settle() {
        let net = net(3);
        let alice = relay(&net, "alice");
        let bob = relay(&net, "bob");
        let pointer = ContentPointer::Blob("h1".into());

        let first = alice.signal(&bob.address(), &pointer, "one").await.unwrap();
        // Stale views still show the spent output; the relay waits them out
        let second = alice.signal(&bob.address(), &pointer, "two").await.unwrap();
        assert_ne!(first.txid, second.txid);
        assert_eq!(net.network.broadcast_count().unwrap(), 2);

        // The funding outpoint settled and was dropped; only the change the
        // second signal spent is still tracked
        let spent = alice.spent.lock().unwrap();
        assert_eq!(spent.len(), 1);
        assert!(spent.iter().all(|o| o.txid == first.txid));
    }

    #[tokio::test]
    async fn test_signal_gives_up_without_funds() {
        let net = net(0);
        let alice = SecureRelay::new(
            Arc::new(Wallet::new("broke")),
            net.services.clone(),
            RelaySettings {
                settle: RetryPolicy::immediate(2),
                ..RelaySettings::default()
            },
        );
        let result = alice
            .signal(&Wallet::new("x").address(), &ContentPointer::Blob("h".into()), "s")
            .await;
        assert!(matches!(result, Err(RelayError::NotSettled)));
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let net = net(0);
        let alice = relay(&net, "alice");
        let result = alice.send_encrypted("zz", b"x", Channel::Blob).await;
        assert!(matches!(result, Err(RelayError::InvalidRecipient(_))));

        let result = alice.signal("not-an-address", &ContentPointer::Blob("h".into()), "s").await;
        assert!(matches!(result, Err(RelayError::SignalBuild(_))));
    }
}
