//! Coordination flows
//!
//! `Toolkit` wires every component from one `Config` and one set of
//! `Services`. Each public method is one step a participant runs: the
//! initiator collects keys, proposes and finishes; holders sign.

use crate::config::{Config, ConfigError};
use crate::core::{Script, TxOutput};
use crate::multisig::{
    sign_unsigned, CollectFailure, CombineReport, Delivery, HolderKey, MultisigError, Round,
    RoundState, RoundStore, SignatureAggregator, SignatureRecord, SpendOutput, ThresholdWallet,
    TransactionComposer,
};
use crate::relay::{
    Envelope, PriceUpdatePayload, Received, RelayError, RequestPayload, SecureRelay,
    SignalTransaction, SigningRequest,
};
use crate::services::{with_timeout, Services};
use crate::token::{CollectorError, KeyCollector, KeyLookup};
use crate::wallet::Wallet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Subject of the signal carrying a signing request
pub const SIGNING_REQUEST_SUBJECT: &str = "multisig signing request";

/// Application id update data is stored under
pub const UPDATE_APP_ID: &str = "p2wdb-update";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("No local wallet loaded")]
    NoWallet,
    #[error("No write price address configured")]
    NoWritePriceAddress,
    #[error("Round {id} is {state:?}, expected {expected:?}")]
    RoundState {
        id: String,
        state: RoundState,
        expected: RoundState,
    },
    #[error("Key collection error: {0}")]
    CollectorError(#[from] CollectorError),
    #[error("Multisig error: {0}")]
    MultisigError(#[from] MultisigError),
    #[error("Relay error: {0}")]
    RelayError(#[from] RelayError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<crate::services::ServiceError> for CoordinatorError {
    fn from(err: crate::services::ServiceError) -> Self {
        CoordinatorError::RelayError(err.into())
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Holder the signing request could not reach
#[derive(Debug)]
pub struct FanOutFailure {
    pub address: String,
    pub error: RelayError,
}

/// Per-holder outcome of distributing a signing request
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub delivered: Vec<Delivery>,
    pub failed: Vec<FanOutFailure>,
}

/// Result of `propose`
#[derive(Debug)]
pub struct Proposal {
    pub round: Round,
    pub fan_out: FanOutReport,
}

/// Result of `sign_request`
#[derive(Debug)]
pub struct SignOutcome {
    pub round_id: String,
    pub records: Vec<SignatureRecord>,
    pub reply: SignalTransaction,
}

/// Result of a broadcast round
#[derive(Debug)]
pub struct FinishReport {
    pub txid: String,
    pub combine: CombineReport,
    /// Signals that could not be read or decoded
    pub failures: Vec<CollectFailure>,
}

/// Update data pinned by `publish_update`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateData {
    pub group_id: String,
    pub keys: Vec<HolderKey>,
    pub wallet: ThresholdWallet,
    pub multisig_address: String,
    pub write_price: u64,
}

/// Result of `publish_update`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePublication {
    pub cid: String,
    pub txid: String,
}

/// A read message, decoded when it is a relay envelope
#[derive(Debug)]
pub struct Message {
    pub received: Received,
    pub envelope: Option<Envelope>,
}

// =============================================================================
// Toolkit
// =============================================================================

pub struct Toolkit {
    config: Config,
    services: Services,
    wallet: Option<Arc<Wallet>>,
    relay: Option<Arc<SecureRelay>>,
}

impl Toolkit {
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            config,
            services,
            wallet: None,
            relay: None,
        }
    }

    /// Bind a local wallet, enabling every flow that sends or reads messages
    pub fn with_wallet(mut self, wallet: Wallet) -> Self {
        let wallet = Arc::new(wallet);
        self.relay = Some(Arc::new(SecureRelay::new(
            wallet.clone(),
            self.services.clone(),
            self.config.relay_settings(),
        )));
        self.wallet = Some(wallet);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn wallet(&self) -> Result<&Arc<Wallet>, CoordinatorError> {
        self.wallet.as_ref().ok_or(CoordinatorError::NoWallet)
    }

    fn relay(&self) -> Result<&Arc<SecureRelay>, CoordinatorError> {
        self.relay.as_ref().ok_or(CoordinatorError::NoWallet)
    }

    pub fn rounds(&self) -> Result<RoundStore, CoordinatorError> {
        Ok(RoundStore::new(&self.config.rounds_dir())?)
    }

    // =========================================================================
    // Key discovery and wallet
    // =========================================================================

    fn collector(&self) -> KeyCollector {
        KeyCollector::new(
            self.services.registry.clone(),
            self.services.ledger.clone(),
            self.config.request_timeout(),
        )
    }

    /// Distinct addresses holding the group's member NFTs, e.g. to hand out
    /// voting tokens. Holders need not have revealed a public key.
    pub async fn holder_addresses(&self, group_id: &str) -> Result<Vec<String>, CoordinatorError> {
        let collector = self.collector();
        let members = collector.enumerate_members(group_id).await?;
        let addresses = collector.holder_addresses(&members).await?;
        log::info!("Group {}: {} distinct holder(s)", group_id, addresses.len());
        Ok(addresses)
    }

    /// Public keys of the group's current NFT holders
    pub async fn collect_keys(&self, group_id: &str) -> Result<KeyLookup, CoordinatorError> {
        let lookup = self.collector().collect(group_id).await?;
        log::info!(
            "Group {}: {} key(s) found, {} holder(s) without a public key, {} lookup(s) failed",
            group_id,
            lookup.found.len(),
            lookup.not_found.len(),
            lookup.failed.len()
        );
        Ok(lookup)
    }

    pub fn create_wallet(&self, keys: &[HolderKey]) -> Result<ThresholdWallet, CoordinatorError> {
        let wallet = ThresholdWallet::build(keys)?;
        log::info!("Multisig wallet {} ({})", wallet.address, wallet.description());
        Ok(wallet)
    }

    // =========================================================================
    // Initiator
    // =========================================================================

    /// Compose a spend from the holders' wallet and send it to every holder
    pub async fn propose(
        &self,
        holders: &[HolderKey],
        payload: RequestPayload,
        spends: &[SpendOutput],
    ) -> Result<Proposal, CoordinatorError> {
        let mut round = Round::new(holders)?;
        log::info!("Multisig wallet {} ({})", round.wallet.address, round.wallet.description());
        self.compose_round(&mut round, &payload, spends).await?;

        let fan_out = self.fan_out(&round, holders, payload).await?;
        round.fanned_out(fan_out.delivered.clone())?;
        self.rounds()?.save(&round)?;

        log::info!(
            "Round {}: request delivered to {} of {} holder(s)",
            round.id,
            fan_out.delivered.len(),
            holders.len()
        );
        Ok(Proposal { round, fan_out })
    }

    async fn compose_round(
        &self,
        round: &mut Round,
        payload: &RequestPayload,
        spends: &[SpendOutput],
    ) -> Result<(), CoordinatorError> {
        let composer = TransactionComposer::new(
            self.services.ledger.clone(),
            self.config.fee_rate(),
            self.config.request_timeout(),
        );
        let tx = composer
            .compose(&round.wallet, &payload.carrier_bytes()?, spends)
            .await?;
        round.composed(tx)?;
        Ok(())
    }

    /// Deliver one encrypted request per holder; failures do not stop the rest
    async fn fan_out(
        &self,
        round: &Round,
        holders: &[HolderKey],
        payload: RequestPayload,
    ) -> Result<FanOutReport, CoordinatorError> {
        let relay = self.relay()?;
        let tx = round
            .tx
            .clone()
            .ok_or_else(|| MultisigError::InvalidUnsignedTx("round has no transaction".to_string()))?;
        let request = Envelope::SigningRequest(Box::new(SigningRequest {
            round_id: round.id.clone(),
            wallet: round.wallet.clone(),
            tx,
            payload,
        }))
        .to_bytes()?;

        // Sequential: every signal spends from the same local wallet
        let mut report = FanOutReport::default();
        for holder in holders {
            let sent = relay
                .send_message(
                    &holder.address,
                    &holder.public_key,
                    &request,
                    SIGNING_REQUEST_SUBJECT,
                    self.config.channel,
                )
                .await;
            match sent {
                Ok(signal) => {
                    log::info!("Sent signing request to {} ({})", holder.address, signal.txid);
                    report.delivered.push(Delivery {
                        address: holder.address.clone(),
                        signal_txid: signal.txid,
                    });
                }
                Err(error) => {
                    log::warn!("Could not reach {}: {}", holder.address, error);
                    report.failed.push(FanOutFailure {
                        address: holder.address.clone(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Finish a stored round from the holders' reply signals
    pub async fn finish(
        &self,
        round_id: &str,
        signal_txids: &[String],
    ) -> Result<FinishReport, CoordinatorError> {
        let store = self.rounds()?;
        let mut round = store.load(round_id)?;
        let result = self.finish_round(&mut round, signal_txids).await;
        store.save(&round)?;
        result
    }

    /// Collect, combine and broadcast
    ///
    /// Too few valid signatures leaves the round open for another attempt.
    /// A conflicting broadcast restarts the round so it can be proposed again.
    pub async fn finish_round(
        &self,
        round: &mut Round,
        signal_txids: &[String],
    ) -> Result<FinishReport, CoordinatorError> {
        if round.state != RoundState::FannedOut {
            return Err(CoordinatorError::RoundState {
                id: round.id.clone(),
                state: round.state,
                expected: RoundState::FannedOut,
            });
        }
        let tx = round
            .tx
            .clone()
            .ok_or_else(|| MultisigError::InvalidUnsignedTx("round has no transaction".to_string()))?;

        let aggregator = SignatureAggregator::new(
            self.relay()?.clone(),
            self.services.ledger.clone(),
            self.config.signature_policy,
            self.config.request_timeout(),
        );
        let collected = aggregator.collect(signal_txids).await;

        match aggregator.finish(&tx, &collected.records).await {
            Ok(outcome) => {
                round.advance(RoundState::ThresholdReached)?;
                round.broadcast(&outcome.txid)?;
                Ok(FinishReport {
                    txid: outcome.txid,
                    combine: outcome.report,
                    failures: collected.failures,
                })
            }
            Err(MultisigError::BroadcastConflict(reason)) => {
                round.restart()?;
                Err(MultisigError::BroadcastConflict(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compose a fresh spend for a restarted round and send it out again
    pub async fn repropose(
        &self,
        round: &mut Round,
        holders: &[HolderKey],
        payload: RequestPayload,
        spends: &[SpendOutput],
    ) -> Result<FanOutReport, CoordinatorError> {
        self.compose_round(round, &payload, spends).await?;
        let fan_out = self.fan_out(round, holders, payload).await?;
        round.fanned_out(fan_out.delivered.clone())?;
        self.rounds()?.save(round)?;
        Ok(fan_out)
    }

    /// Pin the group's update data and commit its CID on-chain
    pub async fn publish_update(
        &self,
        group_id: &str,
        keys: &[HolderKey],
        write_price: u64,
    ) -> Result<UpdatePublication, CoordinatorError> {
        let relay = self.relay()?;
        let write_price_address = self
            .config
            .write_price_address
            .clone()
            .ok_or(CoordinatorError::NoWritePriceAddress)?;
        let wallet = self.create_wallet(keys)?;

        let data = UpdateData {
            group_id: group_id.to_string(),
            keys: keys.to_vec(),
            multisig_address: wallet.address.clone(),
            wallet,
            write_price,
        };
        let json = serde_json::to_string(&data).map_err(|e| RelayError::Payload(e.to_string()))?;

        let timeout = self.config.request_timeout();
        let handle = with_timeout(timeout, self.services.blobs.put(&json, UPDATE_APP_ID)).await?;
        let cid = with_timeout(timeout, self.services.blobs.pin(&handle)).await?;
        log::info!("Update data pinned as {}", cid);

        let commitment = RequestPayload::PriceUpdate(PriceUpdatePayload {
            cid: cid.clone(),
            ts: Utc::now().timestamp_millis(),
        });
        let carrier = commitment.carrier_bytes()?;
        let outputs = vec![
            TxOutput::new(0, Script::data_carrier(&[carrier.as_slice()]).map_err(to_relay)?),
            TxOutput::new(
                self.config.dust_amount,
                Script::for_address(&write_price_address).map_err(to_relay)?,
            ),
        ];
        let txid = relay.broadcast_outputs(outputs).await?;
        log::info!("Update {} committed in {}", cid, txid);

        Ok(UpdatePublication { cid, txid })
    }

    // =========================================================================
    // Holder
    // =========================================================================

    /// Sign the request a signal points at and reply to its sender
    pub async fn sign_request(&self, signal_txid: &str) -> Result<SignOutcome, CoordinatorError> {
        let relay = self.relay()?;
        let wallet = self.wallet()?;

        let received = relay.receive(signal_txid).await?;
        let request = match Envelope::from_bytes(&received.payload)? {
            Envelope::SigningRequest(request) => request,
            other => return Err(RelayError::UnexpectedEnvelope(other.kind().to_string()).into()),
        };

        request.wallet.verify_address()?;
        request.tx.check_wallet(&request.wallet)?;
        if request.tx.payload() != Some(request.payload.carrier_bytes()?) {
            return Err(MultisigError::InvalidUnsignedTx(
                "data carrier does not match the request payload".to_string(),
            )
            .into());
        }

        let records = sign_unsigned(&request.tx, wallet.key_pair())?;

        let sender_key = with_timeout(
            self.config.request_timeout(),
            self.services.ledger.get_public_key(&received.sender),
        )
        .await?;
        let reply = Envelope::Signature(records.clone()).to_bytes()?;
        let subject = format!("signature from {}", wallet.address());
        let signal = relay
            .send_message(&received.sender, &sender_key, &reply, &subject, self.config.channel)
            .await?;
        log::info!("Replied to {} for round {} ({})", received.sender, request.round_id, signal.txid);

        Ok(SignOutcome {
            round_id: request.round_id,
            records,
            reply: signal,
        })
    }

    // =========================================================================
    // Plain messages
    // =========================================================================

    /// Send a text message to an address that has revealed its public key
    pub async fn send_message(
        &self,
        recipient_address: &str,
        subject: &str,
        text: &str,
    ) -> Result<SignalTransaction, CoordinatorError> {
        let relay = self.relay()?;
        let public_key = with_timeout(
            self.config.request_timeout(),
            self.services.ledger.get_public_key(recipient_address),
        )
        .await?;
        let body = Envelope::Text(text.to_string()).to_bytes()?;
        Ok(relay
            .send_message(recipient_address, &public_key, &body, subject, self.config.channel)
            .await?)
    }

    pub async fn read_message(&self, signal_txid: &str) -> Result<Message, CoordinatorError> {
        let received = self.relay()?.receive(signal_txid).await?;
        let envelope = Envelope::from_bytes(&received.payload).ok();
        Ok(Message { received, envelope })
    }
}

fn to_relay(err: crate::core::ScriptError) -> RelayError {
    RelayError::SignalBuild(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{BlobStore, LedgerService, LocalNetwork, RetryPolicy};
    use crate::token::TokenData;
    use tempfile::TempDir;

    struct Council {
        _dir: TempDir,
        network: Arc<LocalNetwork>,
        initiator: Toolkit,
        holders: Vec<Toolkit>,
    }

    fn config(dir: &TempDir, name: &str) -> Config {
        Config {
            data_dir: dir.path().join(name),
            settle: RetryPolicy::immediate(10),
            write_price_address: Some(Wallet::new("price").address()),
            ..Config::default()
        }
    }

    /// Three NFT holders with revealed keys and a funded initiator
    fn council() -> Council {
        let dir = TempDir::new().unwrap();
        let network = Arc::new(LocalNetwork::in_memory());
        let services = Services::local(network.clone());

        let initiator_wallet = Wallet::new("initiator");
        network.fund(&initiator_wallet.address(), 50_000).unwrap();
        let initiator =
            Toolkit::new(config(&dir, "initiator"), services.clone()).with_wallet(initiator_wallet);

        let mut members = Vec::new();
        let mut holders = Vec::new();
        for i in 0..3 {
            let wallet = Wallet::new(&format!("holder{}", i));
            network.fund(&wallet.address(), 20_000).unwrap();
            network
                .reveal_public_key(&wallet.address(), &wallet.public_key())
                .unwrap();
            let nft = format!("nft{}", i);
            network
                .register_token(TokenData::member(nft.clone(), &wallet.address()))
                .unwrap();
            members.push(nft);
            holders.push(
                Toolkit::new(config(&dir, &format!("holder{}", i)), services.clone())
                    .with_wallet(wallet),
            );
        }
        network.register_token(TokenData::group("council", members)).unwrap();

        Council {
            _dir: dir,
            network,
            initiator,
            holders,
        }
    }

    fn price_update(cid: &str) -> RequestPayload {
        RequestPayload::PriceUpdate(PriceUpdatePayload {
            cid: cid.to_string(),
            ts: 1_700_000_000_000,
        })
    }

    async fn funded_proposal(c: &Council, cid: &str) -> (Vec<HolderKey>, Proposal) {
        let keys = c.initiator.collect_keys("council").await.unwrap().found;
        let wallet = c.initiator.create_wallet(&keys).unwrap();
        if c.network.balance(&wallet.address).unwrap() == 0 {
            c.network.fund(&wallet.address, 30_000).unwrap();
        }
        let spend = SpendOutput::new(
            c.initiator.config().write_price_address.clone().unwrap(),
            c.initiator.config().spend_amount,
        );
        let proposal = c
            .initiator
            .propose(&keys, price_update(cid), &[spend])
            .await
            .unwrap();
        (keys, proposal)
    }

    async fn sign_with_first_two(c: &Council, proposal: &Proposal) -> Vec<String> {
        let mut replies = Vec::new();
        for (holder, delivery) in c.holders.iter().zip(&proposal.round.deliveries).take(2) {
            replies.push(holder.sign_request(&delivery.signal_txid).await.unwrap().reply.txid);
        }
        replies
    }

    #[tokio::test]
    async fn test_two_of_three_round() {
        let c = council();
        let (_, proposal) = funded_proposal(&c, "QmUpdate").await;
        assert_eq!(proposal.round.state, RoundState::FannedOut);
        assert_eq!(proposal.fan_out.delivered.len(), 3);
        assert!(proposal.fan_out.failed.is_empty());

        let mut replies = Vec::new();
        for (holder, delivery) in c.holders.iter().zip(&proposal.round.deliveries) {
            let outcome = holder.sign_request(&delivery.signal_txid).await.unwrap();
            assert_eq!(outcome.round_id, proposal.round.id);
            replies.push(outcome.reply.txid);
        }

        // sigA and sigB satisfy 2-of-3; the late sigC is ignored
        let report = c.initiator.finish(&proposal.round.id, &replies).await.unwrap();
        assert_eq!(report.combine.applied.len(), 2);
        assert_eq!(report.combine.ignored.len(), 1);
        assert!(report.failures.is_empty());

        let round = c.initiator.rounds().unwrap().load(&proposal.round.id).unwrap();
        assert_eq!(round.state, RoundState::Broadcast);
        assert_eq!(round.broadcast_txid.as_deref(), Some(report.txid.as_str()));

        let price_addr = c.initiator.config().write_price_address.clone().unwrap();
        assert_eq!(c.network.balance(&price_addr).unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_broadcast_spend_verifies() {
        let c = council();
        let (_, proposal) = funded_proposal(&c, "QmVerify").await;
        let replies = sign_with_first_two(&c, &proposal).await;
        let report = c.initiator.finish(&proposal.round.id, &replies).await.unwrap();

        let data = c.network.get_transaction(&report.txid).await.unwrap();
        assert_eq!(data.sender(), Some(proposal.round.wallet.address.as_str()));
        let tx = proposal.round.tx.as_ref().unwrap();
        assert_eq!(data.vout.len(), tx.outputs.len());
        assert_eq!(
            tx.payload(),
            Some(price_update("QmVerify").carrier_bytes().unwrap())
        );
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_round_open() {
        let c = council();
        let (_, proposal) = funded_proposal(&c, "QmOpen").await;
        let deliveries = &proposal.round.deliveries;

        let first = c.holders[0].sign_request(&deliveries[0].signal_txid).await.unwrap();
        let result = c
            .initiator
            .finish(&proposal.round.id, &[first.reply.txid.clone()])
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::MultisigError(
                MultisigError::InsufficientSignatures { have: 1, need: 2 }
            ))
        ));
        let round = c.initiator.rounds().unwrap().load(&proposal.round.id).unwrap();
        assert_eq!(round.state, RoundState::FannedOut);

        let second = c.holders[2].sign_request(&deliveries[2].signal_txid).await.unwrap();
        let report = c
            .initiator
            .finish(&proposal.round.id, &[first.reply.txid, second.reply.txid])
            .await
            .unwrap();
        assert_eq!(report.combine.applied.len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_reply_is_reported_not_fatal() {
        let c = council();
        let (_, proposal) = funded_proposal(&c, "QmPartial").await;
        let deliveries = &proposal.round.deliveries;

        let mut replies = vec!["00".repeat(32)];
        for i in 0..2 {
            let outcome = c.holders[i].sign_request(&deliveries[i].signal_txid).await.unwrap();
            replies.push(outcome.reply.txid);
        }
        let report = c.initiator.finish(&proposal.round.id, &replies).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.combine.applied.len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_round_restarts() {
        let c = council();
        let (keys, first) = funded_proposal(&c, "QmFirst").await;
        let (_, second) = funded_proposal(&c, "QmSecond").await;
        // Both snapshots chose the wallet's only UTXO
        assert_eq!(
            first.round.tx.as_ref().unwrap().inputs[0].outpoint,
            second.round.tx.as_ref().unwrap().inputs[0].outpoint
        );

        let first_replies = sign_with_first_two(&c, &first).await;
        let second_replies = sign_with_first_two(&c, &second).await;

        c.initiator.finish(&first.round.id, &first_replies).await.unwrap();
        let result = c.initiator.finish(&second.round.id, &second_replies).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::MultisigError(MultisigError::BroadcastConflict(_)))
        ));

        let store = c.initiator.rounds().unwrap();
        let mut round = store.load(&second.round.id).unwrap();
        assert_eq!(round.state, RoundState::WalletBuilt);
        assert_eq!(round.restarts, 1);
        assert!(round.tx.is_none());

        // The change output of the first spend funds the retry
        let fan_out = c
            .initiator
            .repropose(&mut round, &keys, price_update("QmSecond"), &[])
            .await
            .unwrap();
        assert_eq!(fan_out.delivered.len(), 3);
        assert_ne!(
            round.tx.as_ref().unwrap().inputs[0].outpoint,
            first.round.tx.as_ref().unwrap().inputs[0].outpoint
        );
    }

    #[tokio::test]
    async fn test_sign_rejects_tampered_request() {
        let c = council();
        let (keys, proposal) = funded_proposal(&c, "QmTamper").await;

        let mut tx = proposal.round.tx.clone().unwrap();
        tx.outputs[0].script_hex = Script::data_carrier(&[b"other".as_slice()]).unwrap().to_hex();
        let request = Envelope::SigningRequest(Box::new(SigningRequest {
            round_id: proposal.round.id.clone(),
            wallet: proposal.round.wallet.clone(),
            tx,
            payload: price_update("QmTamper"),
        }))
        .to_bytes()
        .unwrap();
        let signal = c
            .initiator
            .relay()
            .unwrap()
            .send_message(&keys[0].address, &keys[0].public_key, &request, "req", c.initiator.config().channel)
            .await
            .unwrap();

        let result = c.holders[0].sign_request(&signal.txid).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::MultisigError(MultisigError::InvalidUnsignedTx(_)))
        ));
    }

    #[tokio::test]
    async fn test_publish_update() {
        let c = council();
        let keys = c.initiator.collect_keys("council").await.unwrap().found;
        let publication = c.initiator.publish_update("council", &keys, 42).await.unwrap();
        assert!(publication.cid.starts_with("Qm"));

        let stored = c.network.get(&publication.cid).await.unwrap();
        let data: UpdateData = serde_json::from_str(&stored).unwrap();
        assert_eq!(data.group_id, "council");
        assert_eq!(data.write_price, 42);
        assert_eq!(data.multisig_address, data.wallet.address);
        assert_eq!(data.keys, keys);

        let tx = c.network.get_transaction(&publication.txid).await.unwrap();
        let price_addr = c.initiator.config().write_price_address.clone().unwrap();
        assert_eq!(c.network.balance(&price_addr).unwrap(), 546);
        let carrier = Script::from_hex(&tx.vout[0].script_hex).unwrap();
        assert!(carrier.is_data_carrier());
        let pushed: Vec<u8> = carrier
            .instructions()
            .unwrap()
            .iter()
            .filter_map(|i| i.data())
            .flatten()
            .copied()
            .collect();
        let commitment: PriceUpdatePayload = serde_json::from_slice(&pushed).unwrap();
        assert_eq!(commitment.cid, publication.cid);
    }

    #[tokio::test]
    async fn test_text_message() {
        let c = council();
        let recipient = &c.holders[1];
        let address = recipient.wallet().unwrap().address();
        let signal = c.initiator.send_message(&address, "hi", "gm council").await.unwrap();

        let message = recipient.read_message(&signal.txid).await.unwrap();
        assert_eq!(message.received.marker.subject, "hi");
        assert_eq!(message.envelope, Some(Envelope::Text("gm council".to_string())));
        assert_eq!(message.received.sender, c.initiator.wallet().unwrap().address());
    }

    #[tokio::test]
    async fn test_holder_addresses_for_a_vote() {
        let c = council();
        let silent = Wallet::new("silent").address();
        c.network
            .register_token(TokenData::member("nft-extra", &c.holders[0].wallet().unwrap().address()))
            .unwrap();
        c.network.register_token(TokenData::member("nft-silent", &silent)).unwrap();
        let members = ["nft0", "nft-extra", "nft1", "nft-silent"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        c.network.register_token(TokenData::group("voters", members)).unwrap();

        let addresses = c.initiator.holder_addresses("voters").await.unwrap();
        let expected = vec![
            c.holders[0].wallet().unwrap().address(),
            c.holders[1].wallet().unwrap().address(),
            silent,
        ];
        assert_eq!(addresses, expected);

        assert!(matches!(
            c.initiator.holder_addresses("nobody").await,
            Err(CoordinatorError::CollectorError(_))
        ));
    }

    #[tokio::test]
    async fn test_flows_need_a_wallet() {
        let c = council();
        let bare = Toolkit::new(c.initiator.config().clone(), Services::local(c.network.clone()));
        assert!(matches!(
            bare.read_message("00").await,
            Err(CoordinatorError::NoWallet)
        ));
        // Key discovery works without one
        assert_eq!(bare.collect_keys("council").await.unwrap().found.len(), 3);
    }
}
