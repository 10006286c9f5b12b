//! Nostr events and a websocket relay client
//!
//! Only what the relay channel needs: BIP-340 signed kind-1 events,
//! `EVENT` publication and a single-shot `REQ` by event id.

use crate::crypto::sha256;
use crate::services::{PubSubRelay, ServiceError};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use secp256k1::{schnorr, Keypair, Message as SecpMessage, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Text note
pub const KIND_TEXT_NOTE: u32 = 1;

/// A signed Nostr event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    pub id: String,
    /// x-only public key, hex
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

fn event_hash(pubkey: &str, created_at: i64, kind: u32, tags: &[Vec<String>], content: &str) -> Vec<u8> {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    sha256(canonical.as_bytes())
}

impl NostrEvent {
    /// Build and sign a text note
    pub fn text_note(secret_key: &SecretKey, content: &str, tags: Vec<Vec<String>>) -> Result<Self, ServiceError> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, secret_key);
        let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        let pubkey = hex::encode(xonly.serialize());
        let created_at = Utc::now().timestamp();

        let id = event_hash(&pubkey, created_at, KIND_TEXT_NOTE, &tags, content);
        let message = SecpMessage::from_digest_slice(&id).map_err(|e| ServiceError::Invalid(e.to_string()))?;
        let sig = secp.sign_schnorr(&message, &keypair);

        Ok(Self {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind: KIND_TEXT_NOTE,
            tags,
            content: content.to_string(),
            sig: sig.to_string(),
        })
    }

    /// Check the id commits to the content and the signature to the id
    pub fn verify(&self) -> bool {
        let id = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(&id) != self.id {
            return false;
        }
        let parsed = (|| {
            let xonly = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey).ok()?).ok()?;
            let sig = schnorr::Signature::from_slice(&hex::decode(&self.sig).ok()?).ok()?;
            let message = SecpMessage::from_digest_slice(&id).ok()?;
            Some((xonly, sig, message))
        })();
        match parsed {
            Some((xonly, sig, message)) => Secp256k1::verification_only()
                .verify_schnorr(&sig, &message, &xonly)
                .is_ok(),
            None => false,
        }
    }
}

// =============================================================================
// Websocket client
// =============================================================================

/// Relay reached over a websocket (`ws://` only)
#[derive(Debug, Clone)]
pub struct NostrClient {
    url: String,
    timeout: Duration,
}

impl NostrClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request frame and read frames until `handle` yields a result
    async fn exchange<T>(
        &self,
        request: Value,
        mut handle: impl FnMut(&[Value]) -> Option<Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        let session = async {
            let (socket, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| ServiceError::Unavailable(format!("{}: {}", self.url, e)))?;
            let (mut sender, mut receiver) = socket.split();

            sender
                .send(Message::Text(request.to_string().into()))
                .await
                .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

            while let Some(frame) = receiver.next().await {
                let frame = frame.map_err(|e| ServiceError::Unavailable(e.to_string()))?;
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let parsed: Vec<Value> = match serde_json::from_str(text.as_str()) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };
                if let Some(result) = handle(&parsed) {
                    let _ = sender.send(Message::Close(None)).await;
                    return result;
                }
            }
            Err(ServiceError::Unavailable(format!("{} closed the connection", self.url)))
        };

        tokio::time::timeout(self.timeout, session)
            .await
            .map_err(|_| ServiceError::Timeout(self.timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl PubSubRelay for NostrClient {
    async fn publish(&self, event: &NostrEvent) -> Result<String, ServiceError> {
        let request = json!(["EVENT", event]);
        let id = event.id.clone();
        self.exchange(request, |frame| match frame {
            [kind, event_id, accepted, rest @ ..] if kind == "OK" && event_id == id.as_str() => {
                if accepted.as_bool() == Some(true) {
                    Some(Ok(id.clone()))
                } else {
                    let reason = rest.first().and_then(Value::as_str).unwrap_or("rejected");
                    Some(Err(ServiceError::Invalid(reason.to_string())))
                }
            }
            _ => None,
        })
        .await
    }

    async fn fetch_event(&self, event_id: &str) -> Result<NostrEvent, ServiceError> {
        let sub_id = format!("msrelay-{}", event_id.chars().take(8).collect::<String>());
        let request = json!(["REQ", sub_id, { "ids": [event_id] }]);
        self.exchange(request, |frame| match frame {
            [kind, sub, event] if kind == "EVENT" && sub == sub_id.as_str() => {
                match serde_json::from_value::<NostrEvent>(event.clone()) {
                    Ok(ev) if ev.id == event_id && ev.verify() => Some(Ok(ev)),
                    _ => None,
                }
            }
            [kind, sub, ..] if kind == "EOSE" && sub == sub_id.as_str() => {
                Some(Err(ServiceError::NotFound(format!("event {}", event_id))))
            }
            _ => None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_signed_event_verifies() {
        let key = KeyPair::generate();
        let event = NostrEvent::text_note(&key.secret_key, "ciphertext", vec![]).unwrap();

        assert_eq!(event.kind, KIND_TEXT_NOTE);
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(event.verify());
    }

    #[test]
    fn test_tampered_event_fails() {
        let key = KeyPair::generate();
        let mut event = NostrEvent::text_note(&key.secret_key, "hello", vec![]).unwrap();
        event.content = "hullo".to_string();
        assert!(!event.verify());

        let mut event = NostrEvent::text_note(&key.secret_key, "hello", vec![]).unwrap();
        event.pubkey = hex::encode([2u8; 32]);
        assert!(!event.verify());
    }

    #[tokio::test]
    async fn test_fetch_non_ascii_id_fails_cleanly() {
        let client = NostrClient::new("ws://127.0.0.1:1", Duration::from_millis(200));
        let result = client.fetch_event("aéééé").await;
        assert!(matches!(
            result,
            Err(ServiceError::Unavailable(_)) | Err(ServiceError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        let client = NostrClient::new("ws://127.0.0.1:1", Duration::from_millis(500));
        let key = KeyPair::generate();
        let event = NostrEvent::text_note(&key.secret_key, "x", vec![]).unwrap();

        let result = client.publish(&event).await;
        assert!(matches!(
            result,
            Err(ServiceError::Unavailable(_)) | Err(ServiceError::Timeout(_))
        ));
    }
}
