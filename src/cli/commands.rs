//! CLI commands for the relay toolkit
//!
//! Implements all command handlers for the CLI interface. Handlers parse
//! nothing themselves: they build a `Toolkit` from the stored state, run one
//! flow and print the outcome.

use crate::config::Config;
use crate::coordinator::Toolkit;
use crate::multisig::SpendOutput;
use crate::relay::{ApprovalPayload, Channel, Envelope, NostrClient, PriceUpdatePayload, RequestPayload};
use crate::services::{LedgerService, LocalNetwork, Services};
use crate::token::TokenData;
use crate::wallet::WalletManager;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub config: Config,
    pub network: Arc<LocalNetwork>,
    pub wallet_manager: WalletManager,
}

impl AppState {
    /// Load config, wallets and the local network from `data_dir`
    pub fn new(data_dir: &Path) -> CliResult<Self> {
        let config = Config::load(data_dir)?;
        std::fs::create_dir_all(&config.data_dir)?;
        let network = Arc::new(LocalNetwork::open(&config.network_path())?);
        let wallet_manager = WalletManager::new(&config.wallets_dir())?;

        Ok(Self {
            config,
            network,
            wallet_manager,
        })
    }

    fn services(&self) -> Services {
        let services = Services::local(self.network.clone());
        match self.config.channel {
            Channel::Nostr => services.with_pubsub(Arc::new(NostrClient::new(
                self.config.nostr_relay_url.clone(),
                self.config.request_timeout(),
            ))),
            Channel::Blob => services,
        }
    }

    /// Toolkit bound to the named local wallet, if any
    pub fn toolkit(&self, wallet: Option<&str>) -> CliResult<Toolkit> {
        let toolkit = Toolkit::new(self.config.clone(), self.services());
        Ok(match wallet {
            Some(name) => toolkit.with_wallet(self.wallet_manager.load_wallet(name)?),
            None => toolkit,
        })
    }

    fn signing_toolkit(&self, wallet: Option<&str>) -> CliResult<Toolkit> {
        let name = wallet.ok_or("this command needs a local wallet (--wallet <name>)")?;
        self.toolkit(Some(name))
    }

    fn group_id(&self, flag: Option<&str>) -> CliResult<String> {
        flag.map(str::to_string)
            .or_else(|| self.config.group_id.clone())
            .ok_or_else(|| "no group id: pass --group or set it with `init`".into())
    }
}

/// Write `config.json`, keeping stored values the flags do not override
pub fn cmd_init(
    data_dir: &Path,
    group: Option<&str>,
    write_price_address: Option<&str>,
    channel: Option<&str>,
    nostr_relay: Option<&str>,
) -> CliResult<()> {
    let mut config = Config::load(data_dir)?;
    if let Some(group) = group {
        config.group_id = Some(group.to_string());
    }
    if let Some(address) = write_price_address {
        config.write_price_address = Some(address.to_string());
    }
    if let Some(channel) = channel {
        config.channel = channel.parse::<Channel>()?;
    }
    if let Some(url) = nostr_relay {
        config.nostr_relay_url = url.to_string();
    }
    config.save()?;

    println!("✅ Configuration saved!");
    println!("   📁 Data directory: {:?}", config.data_dir);
    println!("   👥 Group: {}", config.group_id.as_deref().unwrap_or("-"));
    println!("   📨 Channel: {:?}", config.channel);
    println!("   💸 Fee rate: {} sat/byte", config.fee_rate);
    Ok(())
}

// =============================================================================
// Wallets
// =============================================================================

/// Create a new wallet
pub fn cmd_wallet_new(state: &AppState, name: &str) -> CliResult<()> {
    let wallet = state.wallet_manager.create_wallet(name)?;

    println!("🔐 New wallet created!");
    println!("   🏷️  Name: {}", wallet.name);
    println!("   📍 Address: {}", wallet.address());
    println!("   🔑 Public Key: {}", wallet.public_key());
    println!("\n   ⚠️  IMPORTANT: Your private key is stored in the wallets directory.");
    println!("   Back up this directory to avoid losing access to your funds!");
    Ok(())
}

/// Import a wallet from a hex private key
pub fn cmd_wallet_import(state: &AppState, name: &str, private_key: &str) -> CliResult<()> {
    let wallet = state.wallet_manager.import_wallet(name, private_key)?;
    println!("📥 Imported wallet '{}' ({})", wallet.name, wallet.address());
    Ok(())
}

/// List all wallets
pub fn cmd_wallet_list(state: &AppState) -> CliResult<()> {
    let wallets = state.wallet_manager.list_wallets()?;

    if wallets.is_empty() {
        println!("📭 No wallets found. Create one with: msrelay wallet new <name>");
        return Ok(());
    }

    println!("📋 Wallets:");
    for info in &wallets {
        let balance = state.network.balance(&info.address)?;
        println!("   {} ({}) - {} sat", info.name, info.address, balance);
    }
    Ok(())
}

/// Show one wallet with its UTXOs
pub async fn cmd_wallet_show(state: &AppState, name: &str) -> CliResult<()> {
    let wallet = state.wallet_manager.load_wallet(name)?;
    let utxos = state.network.get_utxos(&wallet.address()).await?;

    println!("💰 Wallet '{}'", wallet.name);
    println!("   ├─ Address: {}", wallet.address());
    println!("   ├─ Public key: {}", wallet.public_key());
    println!("   └─ Balance: {} sat in {} UTXO(s)", utxos.iter().map(|u| u.value).sum::<u64>(), utxos.len());
    for utxo in utxos.iter().take(10) {
        println!("      └─ {}:{} = {} sat", &utxo.txid[..16], utxo.vout, utxo.value);
    }
    Ok(())
}

// =============================================================================
// Coordination
// =============================================================================

/// Look up the public keys of a group's NFT holders
pub async fn cmd_collect_keys(state: &AppState, group: Option<&str>) -> CliResult<()> {
    let group_id = state.group_id(group)?;
    let lookup = state.toolkit(None)?.collect_keys(&group_id).await?;

    println!("🔑 Keys for group {}", group_id);
    for key in &lookup.found {
        println!("   ✅ {} {}", key.address, key.public_key);
    }
    for address in &lookup.not_found {
        println!("   ❌ {} has not revealed a public key", address);
    }
    for failure in &lookup.failed {
        println!("   ⚠️  {} lookup failed: {}", failure.address, failure.error);
    }
    Ok(())
}

/// Print the group's holder addresses, e.g. for a voting airdrop
pub async fn cmd_vote_addrs(state: &AppState, group: Option<&str>) -> CliResult<()> {
    let group_id = state.group_id(group)?;
    let addresses = state.toolkit(None)?.holder_addresses(&group_id).await?;

    println!("🗳️  {} holder address(es) for group {}", addresses.len(), group_id);
    for address in &addresses {
        println!("   {}", address);
    }
    println!("{}", serde_json::to_string(&addresses)?);
    Ok(())
}

/// Derive the group's multisig wallet
pub async fn cmd_create_wallet(state: &AppState, group: Option<&str>) -> CliResult<()> {
    let group_id = state.group_id(group)?;
    let toolkit = state.toolkit(None)?;
    let lookup = toolkit.collect_keys(&group_id).await?;
    let wallet = toolkit.create_wallet(&lookup.found)?;

    println!("🏦 Multisig wallet ({})", wallet.description());
    println!("{}", serde_json::to_string_pretty(&wallet)?);
    Ok(())
}

/// Compose a multisig spend and send it to every holder
pub async fn cmd_propose(
    state: &AppState,
    wallet: Option<&str>,
    group: Option<&str>,
    cid: &str,
    approval: Option<u64>,
) -> CliResult<()> {
    let group_id = state.group_id(group)?;
    let toolkit = state.signing_toolkit(wallet)?;
    let lookup = toolkit.collect_keys(&group_id).await?;
    if !lookup.not_found.is_empty() {
        println!("⚠️  {} holder(s) left out: no public key on record", lookup.not_found.len());
    }
    if !lookup.failed.is_empty() {
        println!("⚠️  {} holder(s) left out: key lookup failed", lookup.failed.len());
    }

    let (payload, spends) = match approval {
        Some(write_price) => {
            let multisig = toolkit.create_wallet(&lookup.found)?;
            let payload = RequestPayload::Approval(ApprovalPayload {
                group_id: group_id.clone(),
                cid: cid.to_string(),
                multisig_address: multisig.address,
                write_price,
            });
            (payload, Vec::new())
        }
        None => {
            let payload = RequestPayload::PriceUpdate(PriceUpdatePayload {
                cid: cid.to_string(),
                ts: Utc::now().timestamp_millis(),
            });
            let spends = state
                .config
                .write_price_address
                .iter()
                .map(|a| SpendOutput::new(a.clone(), state.config.spend_amount))
                .collect();
            (payload, spends)
        }
    };

    let proposal = toolkit.propose(&lookup.found, payload, &spends).await?;

    println!("📤 Round {} proposed", proposal.round.id);
    println!("   🏦 Wallet: {} ({})", proposal.round.wallet.address, proposal.round.wallet.description());
    for delivery in &proposal.fan_out.delivered {
        println!("   ✅ {} via {}", delivery.address, delivery.signal_txid);
    }
    for failure in &proposal.fan_out.failed {
        println!("   ❌ {}: {}", failure.address, failure.error);
    }
    Ok(())
}

/// Sign the request a signal points at
pub async fn cmd_sign(state: &AppState, wallet: Option<&str>, txid: &str) -> CliResult<()> {
    let outcome = state.signing_toolkit(wallet)?.sign_request(txid).await?;

    println!("✍️  Signed round {}", outcome.round_id);
    println!("   Signatures: {}", outcome.records.len());
    println!("   Reply sent to {} via {}", outcome.reply.recipient, outcome.reply.txid);
    Ok(())
}

/// Combine collected signatures and broadcast
pub async fn cmd_finish(
    state: &AppState,
    wallet: Option<&str>,
    round_id: &str,
    txids: &[String],
) -> CliResult<()> {
    let report = state.signing_toolkit(wallet)?.finish(round_id, txids).await?;

    println!("✅ Round {} broadcast as {}", round_id, report.txid);
    println!("   Applied: {}", report.combine.applied.len());
    for record in &report.combine.ignored {
        println!("   ⏭️  Ignored extra signature from {}", record.signer_address);
    }
    for (record, reason) in &report.combine.rejected {
        println!("   ❌ Rejected {}: {}", record.signer_address, reason);
    }
    for failure in &report.failures {
        println!("   ⚠️  Signal {}: {}", failure.signal_txid, failure.error);
    }
    Ok(())
}

/// List stored rounds
pub fn cmd_rounds(state: &AppState) -> CliResult<()> {
    let rounds = state.toolkit(None)?.rounds()?.list()?;
    if rounds.is_empty() {
        println!("📭 No rounds yet");
        return Ok(());
    }
    println!("🔄 Rounds:");
    for round in &rounds {
        println!(
            "   {} | {:?} | {} | {} deliveries | {}",
            round.id,
            round.state,
            round.wallet.description(),
            round.deliveries.len(),
            round.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Pin the group's update data and commit its CID
pub async fn cmd_publish_update(
    state: &AppState,
    wallet: Option<&str>,
    group: Option<&str>,
    write_price: u64,
) -> CliResult<()> {
    let group_id = state.group_id(group)?;
    let toolkit = state.signing_toolkit(wallet)?;
    let lookup = toolkit.collect_keys(&group_id).await?;
    let publication = toolkit.publish_update(&group_id, &lookup.found, write_price).await?;

    println!("📌 Update data pinned as {}", publication.cid);
    println!("   Commitment txid: {}", publication.txid);
    Ok(())
}

// =============================================================================
// Messages
// =============================================================================

pub async fn cmd_msg_send(
    state: &AppState,
    wallet: Option<&str>,
    to: &str,
    subject: &str,
    text: &str,
) -> CliResult<()> {
    let signal = state
        .signing_toolkit(wallet)?
        .send_message(to, subject, text)
        .await?;
    println!("📨 Message to {} signalled in {}", signal.recipient, signal.txid);
    println!("   Stored at {}", signal.marker.pointer);
    Ok(())
}

pub async fn cmd_msg_read(state: &AppState, wallet: Option<&str>, txid: &str) -> CliResult<()> {
    let message = state.signing_toolkit(wallet)?.read_message(txid).await?;

    println!("📬 From: {}", message.received.sender);
    println!("   Subject: {}", message.received.marker.subject);
    match message.envelope {
        Some(Envelope::Text(text)) => println!("\n{}", text),
        Some(other) => println!("   ({} message, use `sign` or `finish`)", other.kind()),
        None => println!("\n{}", String::from_utf8_lossy(&message.received.payload)),
    }
    Ok(())
}

// =============================================================================
// Devnet
// =============================================================================

pub fn cmd_devnet_fund(state: &AppState, address: &str, amount: u64) -> CliResult<()> {
    let txid = state.network.fund(address, amount)?;
    println!("🚰 Funded {} with {} sat ({})", address, amount, txid);
    Ok(())
}

pub fn cmd_devnet_register_group(state: &AppState, id: &str, members: &[String]) -> CliResult<()> {
    state.network.register_token(TokenData::group(id, members.to_vec()))?;
    println!("👥 Registered group {} with {} member NFT(s)", id, members.len());
    Ok(())
}

pub fn cmd_devnet_register_nft(state: &AppState, id: &str, holder: &str) -> CliResult<()> {
    state.network.register_token(TokenData::member(id, holder))?;
    println!("🎫 Registered NFT {} held by {}", id, holder);
    Ok(())
}

pub fn cmd_devnet_reveal_key(state: &AppState, wallet: &str) -> CliResult<()> {
    let wallet = state.wallet_manager.load_wallet(wallet)?;
    state
        .network
        .reveal_public_key(&wallet.address(), &wallet.public_key())?;
    println!("🔓 Public key of {} is now on record", wallet.address());
    Ok(())
}
