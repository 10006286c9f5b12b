//! Token registry records
//!
//! A group token's genesis lists the member NFTs minted under it; each member
//! NFT carries its own genesis holder and transfer history.

use serde::{Deserialize, Serialize};

/// Kind of a token history event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenEventKind {
    Genesis,
    Transfer,
    Mint,
    Burn,
}

/// One transaction touching a token
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenEvent {
    pub txid: String,
    pub kind: TokenEventKind,
    /// Address holding the token after this event
    pub holder: Option<String>,
    /// Block height, used for chronological ordering
    pub height: u64,
}

impl TokenEvent {
    pub fn new(txid: impl Into<String>, kind: TokenEventKind, holder: Option<&str>, height: u64) -> Self {
        Self {
            txid: txid.into(),
            kind,
            holder: holder.map(str::to_string),
            height,
        }
    }
}

/// Genesis metadata of a token
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenesisData {
    /// Member NFT ids minted under a group token
    #[serde(default)]
    pub members: Vec<String>,
    /// Address that received the token at genesis
    pub holder: Option<String>,
    #[serde(default)]
    pub history: Vec<TokenEvent>,
}

/// Registry answer for a token id
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenData {
    pub token_id: String,
    pub genesis: GenesisData,
}

impl TokenData {
    /// Group token listing its member NFTs
    pub fn group(token_id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            token_id: token_id.into(),
            genesis: GenesisData {
                members,
                holder: None,
                history: Vec::new(),
            },
        }
    }

    /// Member NFT minted to `holder`
    pub fn member(token_id: impl Into<String>, holder: &str) -> Self {
        let token_id = token_id.into();
        Self {
            genesis: GenesisData {
                members: Vec::new(),
                holder: Some(holder.to_string()),
                history: vec![TokenEvent::new(
                    token_id.clone(),
                    TokenEventKind::Genesis,
                    Some(holder),
                    0,
                )],
            },
            token_id,
        }
    }

    /// Holder after the most recent transfer, genesis events skipped
    pub fn latest_transfer_holder(&self) -> Option<&str> {
        let mut transfers: Vec<&TokenEvent> = self
            .genesis
            .history
            .iter()
            .filter(|e| e.kind == TokenEventKind::Transfer)
            .collect();
        // Stable sort keeps registry order within a block
        transfers.sort_by_key(|e| e.height);
        transfers.iter().rev().find_map(|e| e.holder.as_deref())
    }
}
