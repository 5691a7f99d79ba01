//! Event envelope codec, the single wire shape relayed to every subscriber.
//!
//! An envelope carries one inbound SMS as a fixed four-field JSON object:
//! `{"type":"sms","sender":...,"message":...,"timestamp":...}`. The greeting
//! sent on connect and the reply sent for inbound subscriber messages are
//! plain strings, not envelopes.

use serde::{Deserialize, Serialize};

/// Plain string sent once to every subscriber right after it connects.
pub const GREETING: &str = "✅ Connected to SMS Receiver";

/// Plain string sent in reply to any inbound subscriber message.
pub const LISTENING_REPLY: &str = "ℹ️ SMS Receiver is listening for incoming messages";

/// Tag discriminating envelope payloads from plain status strings.
///
/// There is a single variant today; the tag is kept as an enum so the wire
/// form stays closed over known values and decoding rejects foreign tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A relayed SMS message.
    Sms,
}

/// One relayed event, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsEnvelope {
    /// Fixed `"sms"` tag.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Originating address, or `"Unknown"` when the source did not carry one.
    pub sender: String,
    /// Message body.
    pub message: String,
    /// Milliseconds since the Unix epoch, as reported by the event source.
    pub timestamp: i64,
}

impl SmsEnvelope {
    /// Build an envelope for one relayed event.
    pub fn new(sender: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: EnvelopeKind::Sms,
            sender: sender.into(),
            message: message.into(),
            timestamp,
        }
    }

    /// Serialize to the single-line JSON text sent verbatim to subscribers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse an envelope back out of its wire form.
    ///
    /// Fails on a foreign `type` tag, a missing field, or anything that is
    /// not a JSON object, which covers the plain greeting and reply strings.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
