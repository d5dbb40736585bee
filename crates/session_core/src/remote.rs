//! Capability surface of the remote messaging-service client.
//!
//! The wire protocol lives behind these traits; the session core only drives
//! connection, authentication and message access through them.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{ApiCredentials, MessageId, Peer, PeerId, Phone, SessionBlob};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub phone: Phone,
    pub credentials: ApiCredentials,
    pub session_blob: Option<SessionBlob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInOutcome {
    Authorized,
    /// The code was accepted but the account has a two-factor password.
    PasswordRequired,
}

#[derive(Debug, Error)]
pub enum SignInError {
    /// The service refused the code or password; the text is shown verbatim.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDialog {
    pub peer: Peer,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub outbound: bool,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// False once the underlying transport has dropped.
    fn is_connected(&self) -> bool;
    async fn is_authorized(&self) -> Result<bool>;
    async fn request_code(&self, phone: &Phone) -> Result<()>;
    async fn sign_in_code(
        &self,
        phone: &Phone,
        code: &str,
    ) -> std::result::Result<SignInOutcome, SignInError>;
    async fn sign_in_password(&self, password: &str) -> std::result::Result<(), SignInError>;
    async fn save_session_blob(&self) -> Result<SessionBlob>;
    async fn iter_dialogs(&self, limit: usize) -> Result<Vec<RemoteDialog>>;
    async fn iter_messages(&self, peer: PeerId, limit: usize) -> Result<Vec<RemoteMessage>>;
    async fn send_message(&self, peer: PeerId, text: &str) -> Result<RemoteMessage>;
    fn subscribe_new_messages(&self) -> broadcast::Receiver<RemoteMessage>;
    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Creates a client for `params` and establishes its transport.
    async fn open(&self, params: ConnectParams) -> Result<Arc<dyn RemoteClient>>;
}
