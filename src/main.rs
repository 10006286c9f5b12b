//! Multisig Relay CLI Application
//!
//! A command-line interface for coordinating threshold spends between the
//! holders of a group's NFTs.

use clap::{Parser, Subcommand};
use multisig_relay::cli::{self, AppState};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "msrelay")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Multisig coordination over an end-to-end encrypted relay", long_about = None)]
struct Cli {
    /// Data directory for config, wallets, rounds and the local network
    #[arg(short, long, default_value = ".msrelay_data")]
    data_dir: PathBuf,

    /// Local wallet to sign and message with
    #[arg(short, long, global = true)]
    wallet: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file
    Init {
        /// Group token whose NFT holders form the multisig
        #[arg(short, long)]
        group: Option<String>,

        /// Address price updates are paid to
        #[arg(long)]
        write_price_address: Option<String>,

        /// Message channel: blob or nostr
        #[arg(long)]
        channel: Option<String>,

        /// Nostr relay websocket URL
        #[arg(long)]
        nostr_relay: Option<String>,
    },

    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Look up the public keys of the group's NFT holders
    CollectKeys {
        #[arg(short, long)]
        group: Option<String>,
    },

    /// List the distinct addresses holding the group's NFTs
    VoteAddrs {
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Derive the group's multisig wallet
    CreateWallet {
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Compose a multisig spend and send it to every holder
    Propose {
        #[arg(short, long)]
        group: Option<String>,

        /// Content id of the pinned update data
        #[arg(long)]
        cid: String,

        /// Request a governance approval at this write price instead of a price update
        #[arg(long)]
        approval: Option<u64>,
    },

    /// Sign the request carried by a signal transaction
    Sign {
        /// Signal transaction id
        #[arg(short, long)]
        txid: String,
    },

    /// Combine the holders' signatures and broadcast
    Finish {
        /// Round id printed by `propose`
        #[arg(short, long)]
        round: String,

        /// Reply signal transaction ids (comma-separated)
        #[arg(short, long)]
        txids: String,
    },

    /// List coordination rounds
    Rounds,

    /// Pin the group's update data and commit its CID on-chain
    PublishUpdate {
        #[arg(short, long)]
        group: Option<String>,

        /// Write price recorded in the update data
        #[arg(long)]
        write_price: u64,
    },

    /// Encrypted messages
    Msg {
        #[command(subcommand)]
        action: MsgCommands,
    },

    /// Local network helpers
    Devnet {
        #[command(subcommand)]
        action: DevnetCommands,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New {
        /// Wallet name
        name: String,
    },

    /// Import a wallet from a hex private key
    Import {
        name: String,

        #[arg(long)]
        private_key: String,
    },

    /// List all wallets
    List,

    /// Show wallet address, key and UTXOs
    Show {
        name: String,
    },
}

#[derive(Subcommand)]
enum MsgCommands {
    /// Send an encrypted text message
    Send {
        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(short, long, default_value = "")]
        subject: String,

        /// Message body
        text: String,
    },

    /// Read the message a signal transaction points at
    Read {
        #[arg(short, long)]
        txid: String,
    },
}

#[derive(Subcommand)]
enum DevnetCommands {
    /// Credit an address
    Fund {
        #[arg(short, long)]
        address: String,

        #[arg(long)]
        amount: u64,
    },

    /// Register a group token listing its member NFTs
    RegisterGroup {
        #[arg(long)]
        id: String,

        /// Member NFT ids (comma-separated)
        #[arg(long)]
        members: String,
    },

    /// Register a member NFT
    RegisterNft {
        #[arg(long)]
        id: String,

        #[arg(long)]
        holder: String,
    },

    /// Put a local wallet's public key on record
    RevealKey {
        name: String,
    },
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Handle init command separately (doesn't need full state)
    if let Commands::Init {
        group,
        write_price_address,
        channel,
        nostr_relay,
    } = &cli.command
    {
        return cli::cmd_init(
            &cli.data_dir,
            group.as_deref(),
            write_price_address.as_deref(),
            channel.as_deref(),
            nostr_relay.as_deref(),
        );
    }

    let state = AppState::new(&cli.data_dir)?;
    let wallet = cli.wallet.as_deref();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cli.command {
            Commands::Init { .. } => unreachable!(),

            Commands::Wallet { action } => match action {
                WalletCommands::New { name } => cli::cmd_wallet_new(&state, &name),
                WalletCommands::Import { name, private_key } => {
                    cli::cmd_wallet_import(&state, &name, &private_key)
                }
                WalletCommands::List => cli::cmd_wallet_list(&state),
                WalletCommands::Show { name } => cli::cmd_wallet_show(&state, &name).await,
            },

            Commands::CollectKeys { group } => cli::cmd_collect_keys(&state, group.as_deref()).await,

            Commands::VoteAddrs { group } => cli::cmd_vote_addrs(&state, group.as_deref()).await,

            Commands::CreateWallet { group } => cli::cmd_create_wallet(&state, group.as_deref()).await,

            Commands::Propose {
                group,
                cid,
                approval,
            } => cli::cmd_propose(&state, wallet, group.as_deref(), &cid, approval).await,

            Commands::Sign { txid } => cli::cmd_sign(&state, wallet, &txid).await,

            Commands::Finish { round, txids } => {
                cli::cmd_finish(&state, wallet, &round, &split_list(&txids)).await
            }

            Commands::Rounds => cli::cmd_rounds(&state),

            Commands::PublishUpdate { group, write_price } => {
                cli::cmd_publish_update(&state, wallet, group.as_deref(), write_price).await
            }

            Commands::Msg { action } => match action {
                MsgCommands::Send { to, subject, text } => {
                    cli::cmd_msg_send(&state, wallet, &to, &subject, &text).await
                }
                MsgCommands::Read { txid } => cli::cmd_msg_read(&state, wallet, &txid).await,
            },

            Commands::Devnet { action } => match action {
                DevnetCommands::Fund { address, amount } => {
                    cli::cmd_devnet_fund(&state, &address, amount)
                }
                DevnetCommands::RegisterGroup { id, members } => {
                    cli::cmd_devnet_register_group(&state, &id, &split_list(&members))
                }
                DevnetCommands::RegisterNft { id, holder } => {
                    cli::cmd_devnet_register_nft(&state, &id, &holder)
                }
                DevnetCommands::RevealKey { name } => cli::cmd_devnet_reveal_key(&state, &name),
            },
        }
    })
}
