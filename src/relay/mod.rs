//! Encrypted message relay
//!
//! - `secure`: encrypt to a public key, park the ciphertext, signal on-chain
//! - `marker`: the data-carrier marker a signal transaction carries
//! - `envelope`: tagged payload types exchanged through the relay
//! - `nostr`: signed events and a websocket relay client

pub mod envelope;
pub mod marker;
pub mod nostr;
pub mod secure;

pub use envelope::{ApprovalPayload, Envelope, PriceUpdatePayload, RequestPayload, SigningRequest};
pub use marker::{ContentPointer, Marker, MARKER_PREFIX};
pub use nostr::{NostrClient, NostrEvent};
pub use secure::{Channel, Received, RelayError, RelaySettings, SecureRelay, SignalTransaction};
