use std::sync::Arc;

use futures::future::join_all;
use link_guard::LinkDangerDetector;
use shared::{
    domain::{ApiCredentials, Phase, PeerId, Phone},
    protocol::{DialogSummary, MessageView, SendReceipt, SessionStatus, VerifyOutcome},
};
use storage::{SessionStore, Storage};
use tracing::{info, warn};

mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod registry;
pub mod remote;

pub use config::{load_settings, Settings};
pub use error::CoreError;
pub use hub::{EventHub, Subscriber};
pub use registry::{ConnectionHandle, ConnectionRegistry, StaleSessionPolicy};

pub const MAX_MESSAGE_PAGE: usize = 200;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub dialog_limit: usize,
    pub subscriber_queue: usize,
    pub stale_session_policy: StaleSessionPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ManagerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            dialog_limit: settings.dialog_limit,
            subscriber_queue: settings.subscriber_queue,
            stale_session_policy: settings.stale_session_policy,
        }
    }
}

/// Entry point for the web layer: sign-in flow, conversation access and
/// live updates, one remote connection per phone.
pub struct SessionManager {
    registry: ConnectionRegistry,
    hub: Arc<EventHub>,
    detector: Arc<LinkDangerDetector>,
    store: Arc<dyn SessionStore>,
    dialog_limit: usize,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn remote::RemoteConnector>,
        store: Arc<dyn SessionStore>,
        detector: Arc<LinkDangerDetector>,
        options: ManagerOptions,
    ) -> Self {
        let hub = EventHub::new(detector.clone(), options.subscriber_queue);
        let registry = ConnectionRegistry::new(
            connector,
            store.clone(),
            hub.clone(),
            options.stale_session_policy,
        );
        Self {
            registry,
            hub,
            detector,
            store,
            dialog_limit: options.dialog_limit.max(1),
        }
    }

    /// Opens the configured session database and link detector.
    pub async fn from_settings(
        settings: &Settings,
        connector: Arc<dyn remote::RemoteConnector>,
    ) -> anyhow::Result<Self> {
        let storage = Storage::new(&settings.database_url).await?;
        let detector = if settings.probe_enabled {
            LinkDangerDetector::with_http_probe(settings.detector_config())?
        } else {
            LinkDangerDetector::offline(settings.detector_config())
        };
        info!(
            database_url = %settings.database_url,
            probe_enabled = settings.probe_enabled,
            stale_session_policy = ?settings.stale_session_policy,
            "session manager initialised"
        );
        Ok(Self::new(
            connector,
            Arc::new(storage),
            Arc::new(detector),
            ManagerOptions::from(settings),
        ))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn detector(&self) -> &Arc<LinkDangerDetector> {
        &self.detector
    }

    /// Starts or resumes sign-in for `phone`. Safe to call repeatedly; an
    /// existing connection is reused.
    pub async fn begin_session(
        &self,
        phone: &str,
        credentials: Option<ApiCredentials>,
    ) -> Result<SessionStatus, CoreError> {
        self.open_session(phone, credentials, false).await
    }

    /// Like [`Self::begin_session`] but always replaces the live connection.
    pub async fn reconnect(
        &self,
        phone: &str,
        credentials: Option<ApiCredentials>,
    ) -> Result<SessionStatus, CoreError> {
        self.open_session(phone, credentials, true).await
    }

    async fn open_session(
        &self,
        phone: &str,
        credentials: Option<ApiCredentials>,
        force_reconnect: bool,
    ) -> Result<SessionStatus, CoreError> {
        let phone = Phone::parse(phone)?;
        if let Some(creds) = &credentials {
            validate_credentials(creds)?;
        }
        let (_, phase) = self
            .registry
            .get_or_create(&phone, credentials, force_reconnect)
            .await?;
        Ok(SessionStatus { phone, phase })
    }

    pub async fn verify_code(&self, phone: &str, code: &str) -> Result<VerifyOutcome, CoreError> {
        let phone = Phone::parse(phone)?;
        let result = self.registry.submit_code(&phone, code).await;
        self.verify_outcome(&phone, result).await
    }

    pub async fn verify_password(
        &self,
        phone: &str,
        password: &str,
    ) -> Result<VerifyOutcome, CoreError> {
        let phone = Phone::parse(phone)?;
        let result = self.registry.submit_password(&phone, password).await;
        self.verify_outcome(&phone, result).await
    }

    async fn verify_outcome(
        &self,
        phone: &Phone,
        result: Result<Phase, CoreError>,
    ) -> Result<VerifyOutcome, CoreError> {
        match result {
            Ok(phase) => Ok(VerifyOutcome {
                ok: true,
                message: match phase {
                    Phase::Authorized => "success".into(),
                    Phase::PasswordRequired => "two-factor password required".into(),
                    _ => "pending".into(),
                },
                phase,
            }),
            Err(CoreError::VerificationRejected(reason)) => {
                let phase = self
                    .registry
                    .phase(phone)
                    .await
                    .unwrap_or(Phase::Unauthenticated);
                Ok(VerifyOutcome {
                    ok: false,
                    message: reason,
                    phase,
                })
            }
            Err(error) => Err(error),
        }
    }

    pub async fn list_dialogs(&self, phone: &str) -> Result<Vec<DialogSummary>, CoreError> {
        let phone = Phone::parse(phone)?;
        let handle = self.authorized_handle(&phone).await?;
        let dialogs = handle
            .client()
            .iter_dialogs(self.dialog_limit)
            .await
            .map_err(|source| CoreError::ConnectionFailed {
                phone: phone.clone(),
                source,
            })?;

        Ok(dialogs
            .into_iter()
            .map(|dialog| DialogSummary {
                id: dialog.peer.id(),
                name: dialog.peer.display_name(),
                kind: dialog.peer.kind(),
                unread_count: dialog.unread_count,
            })
            .collect())
    }

    /// Recent history with `peer_id`, oldest first, each message annotated
    /// with link dangers.
    pub async fn list_messages(
        &self,
        phone: &str,
        peer_id: PeerId,
        limit: usize,
    ) -> Result<Vec<MessageView>, CoreError> {
        let phone = Phone::parse(phone)?;
        if peer_id.0 == 0 {
            return Err(CoreError::InvalidInput("peer id is required".into()));
        }
        if limit == 0 {
            return Err(CoreError::InvalidInput("limit must be at least 1".into()));
        }

        let handle = self.authorized_handle(&phone).await?;
        let mut messages = handle
            .client()
            .iter_messages(peer_id, limit.min(MAX_MESSAGE_PAGE))
            .await
            .map_err(|source| CoreError::ConnectionFailed {
                phone: phone.clone(),
                source,
            })?;
        messages.sort_by_key(|m| (m.timestamp, m.message_id));

        let dangers = join_all(
            messages
                .iter()
                .map(|m| self.detector.detect(m.text.as_deref())),
        )
        .await;

        Ok(messages
            .into_iter()
            .zip(dangers)
            .map(|(message, dangers)| MessageView {
                id: message.message_id,
                text: message.text.unwrap_or_default(),
                timestamp: message.timestamp,
                outbound: message.outbound,
                dangers,
            })
            .collect())
    }

    pub async fn send_text(
        &self,
        phone: &str,
        peer_id: PeerId,
        text: &str,
    ) -> Result<SendReceipt, CoreError> {
        let phone = Phone::parse(phone)?;
        if peer_id.0 == 0 {
            return Err(CoreError::InvalidInput("peer id is required".into()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::InvalidInput("message text is empty".into()));
        }

        let handle = self.authorized_handle(&phone).await?;
        let dangers = self.detector.detect(Some(text)).await;
        if !dangers.is_empty() {
            warn!(
                %phone,
                peer_id = peer_id.0,
                flagged = dangers.len(),
                "outbound message contains dangerous links"
            );
        }

        let sent = handle
            .client()
            .send_message(peer_id, text)
            .await
            .map_err(|source| CoreError::SendFailed { source })?;
        Ok(SendReceipt {
            ok: true,
            message_id: sent.message_id,
            dangers,
        })
    }

    /// Subscribes to live updates for `phone`. The returned stream never
    /// replays past events and unsubscribes when dropped.
    pub fn open_live_updates(&self, phone: &str) -> Result<Subscriber, CoreError> {
        let phone = Phone::parse(phone)?;
        Ok(self.hub.subscribe(&phone))
    }

    /// Ends all live streams and disconnects every client.
    pub async fn shutdown(&self) {
        self.hub.close_all();
        self.registry.close_all().await;
        info!("session manager shut down");
    }

    /// An authorized connection for `phone`, resuming from the stored session
    /// after a restart when one exists.
    async fn authorized_handle(&self, phone: &Phone) -> Result<ConnectionHandle, CoreError> {
        if let Some(handle) = self.registry.authorized(phone).await {
            return Ok(handle);
        }

        let resumable = self
            .store
            .load_session(phone)
            .await
            .map_err(CoreError::storage)?
            .is_some_and(|s| s.has_session_blob());
        if !resumable {
            return Err(CoreError::no_connection(phone));
        }

        match self.registry.get_or_create(phone, None, false).await? {
            (handle, Phase::Authorized) => Ok(handle),
            _ => Err(CoreError::no_connection(phone)),
        }
    }
}

fn validate_credentials(credentials: &ApiCredentials) -> Result<(), CoreError> {
    if credentials.api_id <= 0 {
        return Err(CoreError::InvalidInput("api id must be a positive number".into()));
    }
    if credentials.api_secret.trim().is_empty() {
        return Err(CoreError::InvalidInput("api secret is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
