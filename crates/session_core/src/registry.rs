use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::domain::{ApiCredentials, Phase, Phone};
use storage::{SessionStore, SessionUpdate};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::CoreError,
    hub::EventHub,
    remote::{ConnectParams, RemoteClient, RemoteConnector},
};

/// What to do when a stored session blob no longer authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleSessionPolicy {
    /// Report `PasswordRequired`, treating the session as awaiting two-factor.
    #[default]
    AssumePassword,
    /// Request a fresh one-time code and report `CodeSent`.
    RequestCode,
}

pub(crate) struct Connection {
    pub(crate) client: Arc<dyn RemoteClient>,
    pub(crate) phase: Phase,
    pub(crate) generation: u64,
    pub(crate) credentials: ApiCredentials,
    /// The service accepted a sign-in whose local bookkeeping has not completed.
    pub(crate) sign_in_accepted: bool,
}

impl Connection {
    fn handle(&self, phone: &Phone) -> ConnectionHandle {
        ConnectionHandle {
            phone: phone.clone(),
            client: self.client.clone(),
            generation: self.generation,
        }
    }
}

/// Shared access to a live connection's client.
#[derive(Clone)]
pub struct ConnectionHandle {
    phone: Phone,
    client: Arc<dyn RemoteClient>,
    generation: u64,
}

impl ConnectionHandle {
    pub fn phone(&self) -> &Phone {
        &self.phone
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub(crate) type Slot = Arc<Mutex<Option<Connection>>>;

/// Owns at most one live connection per phone.
///
/// The map lock is only held to look up a phone's slot; the slot lock is held
/// across establishment and sign-in, so requests for one phone are serialized
/// while different phones proceed independently.
pub struct ConnectionRegistry {
    connector: Arc<dyn RemoteConnector>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) hub: Arc<EventHub>,
    stale_policy: StaleSessionPolicy,
    slots: Mutex<HashMap<Phone, Slot>>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn SessionStore>,
        hub: Arc<EventHub>,
        stale_policy: StaleSessionPolicy,
    ) -> Self {
        Self {
            connector,
            store,
            hub,
            stale_policy,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub async fn get_or_create(
        &self,
        phone: &Phone,
        credentials: Option<ApiCredentials>,
        force_reconnect: bool,
    ) -> Result<(ConnectionHandle, Phase), CoreError> {
        let slot = self.slot(phone).await;
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if !force_reconnect && existing.client.is_connected() {
                debug!(%phone, phase = ?existing.phase, "reusing live connection");
                return Ok((existing.handle(phone), existing.phase));
            }
            if !force_reconnect {
                info!(%phone, "live connection went stale; reconnecting");
            }
        }

        let connection = match self.establish(phone, credentials).await {
            Ok(connection) => connection,
            Err(error) => {
                let vacant = current.is_none();
                drop(current);
                if vacant {
                    self.release_vacant_slot(phone, &slot).await;
                }
                return Err(error);
            }
        };
        let phase = connection.phase;
        let handle = connection.handle(phone);

        if let Some(previous) = current.replace(connection) {
            self.hub.detach(phone, previous.generation);
            if let Err(error) = previous.client.disconnect().await {
                warn!(%phone, error = %format!("{error:#}"), "failed to disconnect replaced client");
            }
        }

        info!(%phone, ?phase, generation = handle.generation, "connection ready");
        Ok((handle, phase))
    }

    /// Current phase of the live connection for `phone`, if any.
    pub async fn phase(&self, phone: &Phone) -> Option<Phase> {
        let slot = self.existing_slot(phone).await?;
        let current = slot.lock().await;
        current.as_ref().map(|c| c.phase)
    }

    /// The live connection for `phone` if it is authorized and connected.
    pub async fn authorized(&self, phone: &Phone) -> Option<ConnectionHandle> {
        let slot = self.existing_slot(phone).await?;
        let current = slot.lock().await;
        current
            .as_ref()
            .filter(|c| c.phase.is_authorized() && c.client.is_connected())
            .map(|c| c.handle(phone))
    }

    pub async fn live_connections(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    /// Disconnects every client; used at shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<(Phone, Slot)> = self.slots.lock().await.drain().collect();
        for (phone, slot) in slots {
            let Some(connection) = slot.lock().await.take() else {
                continue;
            };
            self.hub.detach(&phone, connection.generation);
            if let Err(error) = connection.client.disconnect().await {
                warn!(%phone, error = %format!("{error:#}"), "failed to disconnect client");
            }
        }
    }

    pub(crate) async fn existing_slot(&self, phone: &Phone) -> Option<Slot> {
        self.slots.lock().await.get(phone).cloned()
    }

    async fn slot(&self, phone: &Phone) -> Slot {
        self.slots
            .lock()
            .await
            .entry(phone.clone())
            .or_default()
            .clone()
    }

    /// Drops `slot` from the map unless another request is waiting on it or a
    /// connection has since been stored in it.
    async fn release_vacant_slot(&self, phone: &Phone, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        let Some(mapped) = slots.get(phone) else {
            return;
        };
        // One reference held by the map, one by the caller.
        if !Arc::ptr_eq(mapped, slot) || Arc::strong_count(slot) > 2 {
            return;
        }
        if slot.try_lock().is_ok_and(|current| current.is_none()) {
            slots.remove(phone);
            debug!(%phone, "released slot after failed connection attempt");
        }
    }

    async fn establish(
        &self,
        phone: &Phone,
        supplied: Option<ApiCredentials>,
    ) -> Result<Connection, CoreError> {
        let stored = self
            .store
            .load_session(phone)
            .await
            .map_err(CoreError::storage)?;
        let credentials = supplied
            .or_else(|| stored.as_ref().and_then(|s| s.credentials.clone()))
            .ok_or_else(|| CoreError::CredentialsRequired {
                phone: phone.clone(),
            })?;
        let session_blob = stored
            .and_then(|s| s.session_blob)
            .filter(|blob| !blob.is_empty());
        let has_blob = session_blob.is_some();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let client = self
            .connector
            .open(ConnectParams {
                phone: phone.clone(),
                credentials: credentials.clone(),
                session_blob,
            })
            .await
            .map_err(|source| CoreError::connection(phone, source))?;

        match self
            .drive_initial_phase(phone, &client, &credentials, has_blob, generation)
            .await
        {
            Ok(phase) => Ok(Connection {
                client,
                phase,
                generation,
                credentials,
                sign_in_accepted: false,
            }),
            Err(error) => {
                if let Err(disconnect_error) = client.disconnect().await {
                    debug!(
                        %phone,
                        error = %format!("{disconnect_error:#}"),
                        "disconnect after failed establishment also failed"
                    );
                }
                Err(error)
            }
        }
    }

    async fn drive_initial_phase(
        &self,
        phone: &Phone,
        client: &Arc<dyn RemoteClient>,
        credentials: &ApiCredentials,
        has_blob: bool,
        generation: u64,
    ) -> Result<Phase, CoreError> {
        let authorized = client
            .is_authorized()
            .await
            .map_err(|source| CoreError::connection(phone, source))?;

        if authorized {
            self.complete_authorization(phone, client, generation, credentials)
                .await?;
            return Ok(Phase::Authorized);
        }

        self.store
            .save_session(phone, SessionUpdate::default().credentials(credentials.clone()))
            .await
            .map_err(CoreError::storage)?;

        if has_blob && self.stale_policy == StaleSessionPolicy::AssumePassword {
            info!(%phone, "stored session is not authorized; awaiting two-factor password");
            return Ok(Phase::PasswordRequired);
        }

        client
            .request_code(phone)
            .await
            .map_err(|source| CoreError::connection(phone, source))?;
        info!(%phone, stale_session = has_blob, "one-time code requested");
        Ok(Phase::CodeSent)
    }

    /// Persists the resumable session and starts live forwarding.
    pub(crate) async fn complete_authorization(
        &self,
        phone: &Phone,
        client: &Arc<dyn RemoteClient>,
        generation: u64,
        credentials: &ApiCredentials,
    ) -> Result<(), CoreError> {
        let blob = client
            .save_session_blob()
            .await
            .map_err(|source| CoreError::connection(phone, source))?;
        self.store
            .save_session(
                phone,
                SessionUpdate::default()
                    .credentials(credentials.clone())
                    .session_blob(blob)
                    .touched_at(Utc::now()),
            )
            .await
            .map_err(CoreError::storage)?;
        self.hub.attach(phone, generation, client);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
