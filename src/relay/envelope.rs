//! Relayed payload types
//!
//! Everything sent through the relay is an `Envelope`, decoded by its tag
//! rather than by probing for fields.

use crate::multisig::{SignatureRecord, ThresholdWallet, UnsignedTransaction};
use crate::relay::RelayError;
use serde::{Deserialize, Serialize};

/// Price update committed on-chain by a multisig spend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceUpdatePayload {
    /// Content id of the pinned update data
    pub cid: String,
    /// Unix timestamp (milliseconds)
    pub ts: i64,
}

/// Governance approval of a group's multisig and write price
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalPayload {
    pub group_id: String,
    pub cid: String,
    pub multisig_address: String,
    pub write_price: u64,
}

/// What a signing request asks holders to approve
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    PriceUpdate(PriceUpdatePayload),
    Approval(ApprovalPayload),
}

impl RequestPayload {
    /// Bytes embedded in the data-carrier output
    pub fn carrier_bytes(&self) -> Result<Vec<u8>, RelayError> {
        let json = match self {
            RequestPayload::PriceUpdate(p) => serde_json::to_vec(p),
            RequestPayload::Approval(p) => serde_json::to_vec(p),
        };
        json.map_err(|e| RelayError::Payload(e.to_string()))
    }
}

/// Unsigned spend sent to each holder
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningRequest {
    pub round_id: String,
    pub wallet: ThresholdWallet,
    pub tx: UnsignedTransaction,
    pub payload: RequestPayload,
}

/// Tagged container for every relayed message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    SigningRequest(Box<SigningRequest>),
    Signature(Vec<SignatureRecord>),
    Text(String),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::SigningRequest(_) => "signing_request",
            Envelope::Signature(_) => "signature",
            Envelope::Text(_) => "text",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self).map_err(|e| RelayError::Payload(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(bytes).map_err(|e| RelayError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_encoding() {
        let env = Envelope::Text("hello".to_string());
        let json = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"text","data":"hello"}"#);
        assert_eq!(Envelope::from_bytes(json.as_bytes()).unwrap(), env);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result = Envelope::from_bytes(br#"{"type":"price","data":{}}"#);
        assert!(matches!(result, Err(RelayError::Payload(_))));
        assert!(Envelope::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_payload_kinds() {
        let update = RequestPayload::PriceUpdate(PriceUpdatePayload {
            cid: "QmX".into(),
            ts: 1_700_000_000,
        });
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""kind":"price_update""#));
        assert_eq!(serde_json::from_str::<RequestPayload>(&json).unwrap(), update);

        assert_eq!(
            update.carrier_bytes().unwrap(),
            br#"{"cid":"QmX","ts":1700000000}"#.to_vec()
        );
    }
}
