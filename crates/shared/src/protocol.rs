use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, PeerId, PeerKind, Phase, Phone};

/// Why a URL was flagged; serialized as the human-readable reason text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DangerReason {
    #[serde(rename = "known suspicious / shortener domain")]
    SuspiciousDomain,
    #[serde(rename = "suspicious pattern in URL")]
    SuspiciousPattern,
    #[serde(rename = "very long URL (possible obfuscation)")]
    LongUrl,
    #[serde(rename = "redirects to suspicious link")]
    SuspiciousRedirect,
}

impl DangerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DangerReason::SuspiciousDomain => "known suspicious / shortener domain",
            DangerReason::SuspiciousPattern => "suspicious pattern in URL",
            DangerReason::LongUrl => "very long URL (possible obfuscation)",
            DangerReason::SuspiciousRedirect => "redirects to suspicious link",
        }
    }
}

impl fmt::Display for DangerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerAnnotation {
    pub url: String,
    pub reason: DangerReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phone: Phone,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub message: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogSummary {
    pub id: PeerId,
    pub name: String,
    pub kind: PeerKind,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub outbound: bool,
    #[serde(default)]
    pub dangers: Vec<DangerAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub ok: bool,
    pub message_id: MessageId,
    #[serde(default)]
    pub dangers: Vec<DangerAnnotation>,
}

/// One event delivered to a live-update subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub outbound: bool,
    #[serde(default)]
    pub dangers: Vec<DangerAnnotation>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
