//! Key discovery for a group's NFT holders
//!
//! group token -> member NFTs -> current holders -> revealed public keys.

use crate::crypto::public_key_from_hex;
use crate::multisig::HolderKey;
use crate::services::{with_timeout, LedgerService, ServiceError, TokenRegistry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Key collection errors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Registry lookup for {id} failed: {source}")]
    Registry { id: String, source: ServiceError },
    #[error("No holder found for {0}")]
    HolderNotFound(String),
    #[error("Public key lookup for {address} failed: {source}")]
    Ledger { address: String, source: ServiceError },
}

/// Address whose key lookup failed for a reason other than absence
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupFailure {
    pub address: String,
    pub error: ServiceError,
}

/// Holder addresses partitioned by the outcome of their key lookup
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyLookup {
    pub found: Vec<HolderKey>,
    pub not_found: Vec<String>,
    #[serde(default)]
    pub failed: Vec<LookupFailure>,
}

impl KeyLookup {
    pub fn len(&self) -> usize {
        self.found.len() + self.not_found.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep the first occurrence of each address
pub fn dedupe_addresses(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

/// Discovers the public keys of a group's current NFT holders
pub struct KeyCollector {
    registry: Arc<dyn TokenRegistry>,
    ledger: Arc<dyn LedgerService>,
    timeout: Duration,
}

impl KeyCollector {
    pub fn new(registry: Arc<dyn TokenRegistry>, ledger: Arc<dyn LedgerService>, timeout: Duration) -> Self {
        Self {
            registry,
            ledger,
            timeout,
        }
    }

    /// Member NFT ids minted under `group_id`
    pub async fn enumerate_members(&self, group_id: &str) -> Result<Vec<String>, CollectorError> {
        let data = with_timeout(self.timeout, self.registry.get_token_data(group_id))
            .await
            .map_err(|source| CollectorError::Registry {
                id: group_id.to_string(),
                source,
            })?;
        log::info!("Group {} has {} member(s)", group_id, data.genesis.members.len());
        Ok(data.genesis.members)
    }

    /// Current holder of a member NFT: latest transfer, else the genesis holder
    pub async fn resolve_holder(&self, member_id: &str) -> Result<String, CollectorError> {
        let data = with_timeout(self.timeout, self.registry.get_token_data(member_id))
            .await
            .map_err(|source| CollectorError::Registry {
                id: member_id.to_string(),
                source,
            })?;

        data.latest_transfer_holder()
            .or(data.genesis.holder.as_deref())
            .map(str::to_string)
            .ok_or_else(|| CollectorError::HolderNotFound(member_id.to_string()))
    }

    /// Holders of `members`, deduplicated in first-seen order
    pub async fn holder_addresses(&self, members: &[String]) -> Result<Vec<String>, CollectorError> {
        let resolved = join_all(members.iter().map(|m| self.resolve_holder(m))).await;
        let holders = resolved.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(dedupe_addresses(holders))
    }

    /// Public key for one address; `None` when the address never revealed one
    pub async fn lookup_public_key(&self, address: &str) -> Result<Option<String>, CollectorError> {
        match with_timeout(self.timeout, self.ledger.get_public_key(address)).await {
            Ok(key) if public_key_from_hex(&key).is_ok() => Ok(Some(key)),
            Ok(key) => {
                log::warn!("Ledger returned an unusable key for {}: {}", address, key);
                Ok(None)
            }
            Err(ServiceError::NotFound(_)) => Ok(None),
            Err(source) => Err(CollectorError::Ledger {
                address: address.to_string(),
                source,
            }),
        }
    }

    /// Partition `addresses` by lookup outcome; one failing address never
    /// aborts the batch
    pub async fn lookup_public_keys(&self, addresses: &[String]) -> KeyLookup {
        let results = join_all(addresses.iter().map(|a| self.lookup_public_key(a))).await;

        let mut lookup = KeyLookup::default();
        for (address, result) in addresses.iter().zip(results) {
            match result {
                Ok(Some(public_key)) => {
                    log::info!("Found public key for {}", address);
                    lookup.found.push(HolderKey::new(address.clone(), public_key));
                }
                Ok(None) => {
                    log::info!("No public key on record for {}", address);
                    lookup.not_found.push(address.clone());
                }
                Err(CollectorError::Ledger { address, source }) => {
                    log::warn!("Public key lookup for {} failed: {}", address, source);
                    lookup.failed.push(LookupFailure { address, error: source });
                }
                Err(other) => {
                    log::warn!("Public key lookup for {} failed: {}", address, other);
                    lookup.failed.push(LookupFailure {
                        address: address.clone(),
                        error: ServiceError::Unavailable(other.to_string()),
                    });
                }
            }
        }
        lookup
    }

    /// Full discovery for a group
    pub async fn collect(&self, group_id: &str) -> Result<KeyLookup, CollectorError> {
        let members = self.enumerate_members(group_id).await?;
        let holders = self.holder_addresses(&members).await?;
        Ok(self.lookup_public_keys(&holders).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::services::LocalNetwork;
    use crate::token::registry::{TokenData, TokenEvent, TokenEventKind};

    fn collector(net: &Arc<LocalNetwork>) -> KeyCollector {
        KeyCollector::new(net.clone(), net.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let net = Arc::new(LocalNetwork::in_memory());
        let result = collector(&net).enumerate_members("nope").await;
        assert!(matches!(result, Err(CollectorError::Registry { .. })));
    }

    #[tokio::test]
    async fn test_resolve_holder_prefers_latest_transfer() {
        let net = Arc::new(LocalNetwork::in_memory());
        let mut nft = TokenData::member("nft", "alice");
        nft.genesis.history.push(TokenEvent::new("t1", TokenEventKind::Transfer, Some("bob"), 5));
        net.register_token(nft).unwrap();
        net.register_token(TokenData::member("nft2", "carol")).unwrap();

        let mut orphan = TokenData::member("nft3", "x");
        orphan.genesis.holder = None;
        net.register_token(orphan).unwrap();

        let c = collector(&net);
        assert_eq!(c.resolve_holder("nft").await.unwrap(), "bob");
        assert_eq!(c.resolve_holder("nft2").await.unwrap(), "carol");
        assert!(matches!(
            c.resolve_holder("nft3").await,
            Err(CollectorError::HolderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_holders_deduplicated_in_order() {
        let net = Arc::new(LocalNetwork::in_memory());
        for (id, holder) in [("a", "h2"), ("b", "h1"), ("c", "h2"), ("d", "h3")] {
            net.register_token(TokenData::member(id, holder)).unwrap();
        }
        let members: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        let holders = collector(&net).holder_addresses(&members).await.unwrap();
        assert_eq!(holders, vec!["h2", "h1", "h3"]);
    }

    #[tokio::test]
    async fn test_missing_key_is_partitioned() {
        let net = Arc::new(LocalNetwork::in_memory());
        let known: Vec<KeyPair> = (0..2).map(|_| KeyPair::generate()).collect();
        for kp in &known {
            net.reveal_public_key(&kp.address(), &kp.public_key_hex()).unwrap();
        }
        let silent = KeyPair::generate().address();
        let batch = vec![known[0].address(), silent.clone(), known[1].address()];

        let lookup = collector(&net).lookup_public_keys(&batch).await;
        assert_eq!(lookup.len(), batch.len());
        assert!(lookup.failed.is_empty());
        assert_eq!(lookup.not_found, vec![silent.clone()]);
        assert!(lookup.found.iter().all(|k| k.address != silent));
        assert_eq!(lookup.found[1].public_key, known[1].public_key_hex());
    }

    /// Ledger that reports one address as unreachable
    struct FlakyLedger {
        inner: Arc<LocalNetwork>,
        down: String,
    }

    #[async_trait::async_trait]
    impl LedgerService for FlakyLedger {
        async fn get_utxos(&self, address: &str) -> Result<Vec<crate::services::Utxo>, ServiceError> {
            self.inner.get_utxos(address).await
        }

        async fn get_public_key(&self, address: &str) -> Result<String, ServiceError> {
            if address == self.down {
                return Err(ServiceError::Unavailable("blip".to_string()));
            }
            self.inner.get_public_key(address).await
        }

        async fn get_transaction(&self, txid: &str) -> Result<crate::services::TxData, ServiceError> {
            self.inner.get_transaction(txid).await
        }

        async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ServiceError> {
            self.inner.broadcast(raw_tx_hex).await
        }
    }

    #[tokio::test]
    async fn test_failed_lookup_keeps_rest_of_batch() {
        let net = Arc::new(LocalNetwork::in_memory());
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        for kp in &keys {
            net.reveal_public_key(&kp.address(), &kp.public_key_hex()).unwrap();
        }
        let batch: Vec<String> = keys.iter().map(|k| k.address()).collect();
        let ledger = Arc::new(FlakyLedger {
            inner: net.clone(),
            down: batch[1].clone(),
        });

        let lookup = KeyCollector::new(net.clone(), ledger, Duration::from_secs(5))
            .lookup_public_keys(&batch)
            .await;
        assert_eq!(lookup.len(), batch.len());
        assert_eq!(lookup.found.len(), 2);
        assert!(lookup.not_found.is_empty());
        assert_eq!(lookup.failed.len(), 1);
        assert_eq!(lookup.failed[0].address, batch[1]);
        assert_eq!(lookup.failed[0].error, ServiceError::Unavailable("blip".to_string()));
    }

    #[tokio::test]
    async fn test_collect_group() {
        let net = Arc::new(LocalNetwork::in_memory());
        let holders: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let mut members = Vec::new();
        for (i, kp) in holders.iter().enumerate() {
            let id = format!("nft{}", i);
            net.register_token(TokenData::member(id.clone(), &kp.address())).unwrap();
            net.reveal_public_key(&kp.address(), &kp.public_key_hex()).unwrap();
            members.push(id);
        }
        net.register_token(TokenData::group("group", members)).unwrap();

        let lookup = collector(&net).collect("group").await.unwrap();
        let addresses: Vec<String> = lookup.found.iter().map(|k| k.address.clone()).collect();
        let expected: Vec<String> = holders.iter().map(|k| k.address()).collect();
        assert_eq!(addresses, expected);
        assert!(lookup.not_found.is_empty());
    }
}
