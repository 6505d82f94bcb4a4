//! Outbound message envelope and its JSON wire format.

use serde::{Serialize, Serializer};

/// One accepted message for one recipient.
///
/// Serializes to `{"envelope":"<sender>","recipient":"<recipient>","body":"<message>"}`.
/// The body is emitted as a JSON string; invalid UTF-8 sequences are replaced
/// with U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(rename = "envelope")]
    sender: String,
    recipient: String,
    #[serde(serialize_with = "body_as_text")]
    body: Vec<u8>,
}

impl Envelope {
    /// Build an envelope for one recipient.
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body,
        }
    }

    /// Reverse-path from `MAIL FROM`.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Single forward-path from `RCPT TO`.
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Raw message data.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode into the canonical wire payload.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn body_as_text<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}
