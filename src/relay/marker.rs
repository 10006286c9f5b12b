//! On-chain signal marker
//!
//! `OP_RETURN <6dd2> "MSG <IPFS|NOSTR> <pointer> <subject>"`. The marker is
//! recovered by decoding output scripts back into instructions.

use crate::core::{Instruction, OpCode, Script};
use crate::relay::RelayError;
use serde::{Deserialize, Serialize};

/// Memo-style prefix identifying a message signal
pub const MARKER_PREFIX: [u8; 2] = [0x6d, 0xd2];

const MARKER_TAG: &str = "MSG";

/// Handle to encrypted content, tagged with the channel holding it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "channel", content = "id", rename_all = "snake_case")]
pub enum ContentPointer {
    Blob(String),
    Nostr(String),
}

impl ContentPointer {
    pub fn id(&self) -> &str {
        match self {
            ContentPointer::Blob(id) | ContentPointer::Nostr(id) => id,
        }
    }

    fn channel_tag(&self) -> &'static str {
        match self {
            ContentPointer::Blob(_) => "IPFS",
            ContentPointer::Nostr(_) => "NOSTR",
        }
    }
}

impl std::fmt::Display for ContentPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.channel_tag(), self.id())
    }
}

/// Pointer and subject carried by a signal transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    pub pointer: ContentPointer,
    pub subject: String,
}

impl Marker {
    pub fn new(pointer: ContentPointer, subject: &str) -> Self {
        Self {
            pointer,
            subject: subject.to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        format!("{} {} {}", MARKER_TAG, self.pointer, self.subject)
    }

    /// Data-carrier output script for this marker
    pub fn to_script(&self) -> Result<Script, RelayError> {
        let id = self.pointer.id();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(RelayError::SignalBuild(format!("unusable content pointer '{}'", id)));
        }
        if self.subject.contains('\n') {
            return Err(RelayError::SignalBuild("subject must be a single line".to_string()));
        }
        Script::data_carrier(&[&MARKER_PREFIX, self.to_text().as_bytes()])
            .map_err(|e| RelayError::SignalBuild(e.to_string()))
    }

    pub fn parse_text(text: &str) -> Option<Self> {
        let mut parts = text.splitn(4, ' ');
        if parts.next()? != MARKER_TAG {
            return None;
        }
        let channel = parts.next()?;
        let id = parts.next().filter(|id| !id.is_empty())?.to_string();
        let subject = parts.next().unwrap_or("").to_string();
        let pointer = match channel {
            "IPFS" => ContentPointer::Blob(id),
            // event ids are hex
            "NOSTR" if id.chars().all(|c| c.is_ascii_hexdigit()) => ContentPointer::Nostr(id),
            _ => return None,
        };
        Some(Self { pointer, subject })
    }

    /// Marker carried by an output script, if any
    pub fn from_script(script: &Script) -> Option<Self> {
        let ins = script.instructions().ok()?;
        match ins.as_slice() {
            [ret, Instruction::Push(prefix), Instruction::Push(text)]
                if ret.is_op(OpCode::Return) && prefix.as_slice() == MARKER_PREFIX =>
            {
                Self::parse_text(std::str::from_utf8(text).ok()?)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_roundtrip() {
        let marker = Marker::new(ContentPointer::Blob("abc123".into()), "signature from 1Abc");
        let script = marker.to_script().unwrap();

        assert!(script.is_data_carrier());
        assert_eq!(Marker::from_script(&script), Some(marker));
        assert!(script.to_asm().unwrap().starts_with("OP_RETURN 6dd2"));
    }

    #[test]
    fn test_nostr_marker_text() {
        let marker = Marker::new(ContentPointer::Nostr("e1".into()), "");
        assert_eq!(marker.to_text(), "MSG NOSTR e1 ");
        assert_eq!(Marker::parse_text("MSG NOSTR e1"), Some(marker));
    }

    #[test]
    fn test_build_failures() {
        let spaced = Marker::new(ContentPointer::Blob("a b".into()), "s");
        assert!(matches!(spaced.to_script(), Err(RelayError::SignalBuild(_))));

        let huge = Marker::new(ContentPointer::Blob("h".into()), &"x".repeat(300));
        assert!(matches!(huge.to_script(), Err(RelayError::SignalBuild(_))));
    }

    #[test]
    fn test_non_markers() {
        assert_eq!(Marker::from_script(&Script::data_carrier(&[b"MSG IPFS x s"]).unwrap()), None);
        assert_eq!(Marker::parse_text("MSG SMTP x s"), None);
        assert_eq!(Marker::parse_text("HELLO IPFS x s"), None);
        assert_eq!(Marker::parse_text("MSG NOSTR aéééé s"), None);
        let p2pkh = Script::p2pkh(&[0u8; 20]);
        assert_eq!(Marker::from_script(&p2pkh), None);
    }
}
