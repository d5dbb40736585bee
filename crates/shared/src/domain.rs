use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(PeerId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidPhone {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number '{0}' must contain only digits after the leading '+'")]
    NonDigit(String),
}

/// E.164-like phone number, always stored with a leading `+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Phone(String);

impl Phone {
    pub fn parse(raw: &str) -> Result<Self, InvalidPhone> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(InvalidPhone::Empty);
        }
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(InvalidPhone::NonDigit(trimmed.to_string()));
        }
        Ok(Self(format!("+{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Phone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote-service application credentials for one phone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_id: i32,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_id: i32, api_secret: impl Into<String>) -> Self {
        Self {
            api_id,
            api_secret: api_secret.into(),
        }
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_id", &self.api_id)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Opaque resumable-session token produced by the remote client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionBlob(String);

impl SessionBlob {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionBlob({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unauthenticated,
    CodeSent,
    PasswordRequired,
    Authorized,
}

impl Phase {
    pub fn is_authorized(self) -> bool {
        self == Phase::Authorized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    User,
    Group,
    Channel,
}

/// A conversation partner as resolved from the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Peer {
    Person {
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    Group {
        id: PeerId,
        title: String,
    },
    Channel {
        id: PeerId,
        title: String,
    },
}

impl Peer {
    pub fn id(&self) -> PeerId {
        match self {
            Peer::Person { id, .. } | Peer::Group { id, .. } | Peer::Channel { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> PeerKind {
        match self {
            Peer::Person { .. } => PeerKind::User,
            Peer::Group { .. } => PeerKind::Group,
            Peer::Channel { .. } => PeerKind::Channel,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Peer::Group { title, .. } | Peer::Channel { title, .. } => title.clone(),
            Peer::Person {
                id,
                first_name,
                last_name,
                username,
            } => {
                let non_blank = |value: &Option<String>| {
                    value
                        .as_deref()
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                };
                match (non_blank(first_name), non_blank(last_name)) {
                    (Some(first), Some(last)) => format!("{first} {last}"),
                    (Some(first), None) => first,
                    (None, _) => non_blank(username).unwrap_or_else(|| id.0.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
