//! In-process fakes for the remote client and the session store.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use link_guard::{DetectorConfig, LinkDangerDetector};
use shared::domain::{ApiCredentials, MessageId, Peer, PeerId, Phone, SessionBlob};
use storage::{PhoneSession, SessionStore, SessionUpdate};
use tokio::sync::broadcast;

use crate::remote::{
    ConnectParams, RemoteClient, RemoteConnector, RemoteDialog, RemoteMessage, SignInError,
    SignInOutcome,
};

pub(crate) const VALID_CODE: &str = "24680";
pub(crate) const REJECTED_CODE_MESSAGE: &str = "The confirmation code is invalid";
pub(crate) const REJECTED_PASSWORD_MESSAGE: &str = "The password is invalid";

pub(crate) fn phone(raw: &str) -> Phone {
    Phone::parse(raw).expect("test phone should parse")
}

pub(crate) fn credentials() -> ApiCredentials {
    ApiCredentials::new(12345, "0123456789abcdef")
}

pub(crate) fn offline_detector() -> Arc<LinkDangerDetector> {
    Arc::new(LinkDangerDetector::offline(DetectorConfig::default()))
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn message(peer: i64, id: i64, secs: i64, text: &str) -> RemoteMessage {
    RemoteMessage {
        peer_id: PeerId(peer),
        message_id: MessageId(id),
        text: Some(text.to_string()),
        timestamp: at(secs),
        outbound: false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How fake clients opened by a [`FakeConnector`] behave.
#[derive(Debug, Clone)]
pub(crate) struct Behaviour {
    /// A client opened with a stored blob starts out authorized.
    pub resume_authorized: bool,
    /// Two-factor password; `None` means the account has none.
    pub password: Option<String>,
    pub fail_connect: bool,
    pub fail_send: bool,
    pub connect_delay: Duration,
    pub dialogs: Vec<RemoteDialog>,
    pub history: Vec<RemoteMessage>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            resume_authorized: true,
            password: None,
            fail_connect: false,
            fail_send: false,
            connect_delay: Duration::ZERO,
            dialogs: Vec::new(),
            history: Vec::new(),
        }
    }
}

pub(crate) struct FakeClient {
    pub params: ConnectParams,
    behaviour: Behaviour,
    authorized: AtomicBool,
    connected: AtomicBool,
    pub code_requests: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub sign_ins: AtomicUsize,
    blobs_issued: AtomicUsize,
    sent: Mutex<Vec<(PeerId, String)>>,
    inbound: broadcast::Sender<RemoteMessage>,
}

impl FakeClient {
    pub fn new(params: ConnectParams, behaviour: Behaviour) -> Self {
        let authorized = params.session_blob.is_some() && behaviour.resume_authorized;
        let (inbound, _) = broadcast::channel(64);
        Self {
            params,
            behaviour,
            authorized: AtomicBool::new(authorized),
            connected: AtomicBool::new(true),
            code_requests: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            sign_ins: AtomicUsize::new(0),
            blobs_issued: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            inbound,
        }
    }

    /// Simulates a message arriving from the service.
    pub fn push_inbound(&self, message: RemoteMessage) -> usize {
        self.inbound.send(message).unwrap_or(0)
    }

    pub fn inbound_receivers(&self) -> usize {
        self.inbound.receiver_count()
    }

    pub fn drop_transport(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(PeerId, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn request_code(&self, _phone: &Phone) -> Result<()> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_in_code(
        &self,
        _phone: &Phone,
        code: &str,
    ) -> std::result::Result<SignInOutcome, SignInError> {
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
        if code != VALID_CODE {
            return Err(SignInError::Rejected(REJECTED_CODE_MESSAGE.into()));
        }
        if self.behaviour.password.is_some() {
            return Ok(SignInOutcome::PasswordRequired);
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(SignInOutcome::Authorized)
    }

    async fn sign_in_password(&self, password: &str) -> std::result::Result<(), SignInError> {
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour.password {
            Some(expected) if expected == password => {
                self.authorized.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(SignInError::Rejected(REJECTED_PASSWORD_MESSAGE.into())),
        }
    }

    async fn save_session_blob(&self) -> Result<SessionBlob> {
        let issued = self.blobs_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionBlob::new(format!(
            "session:{}:{issued}",
            self.params.phone
        )))
    }

    async fn iter_dialogs(&self, limit: usize) -> Result<Vec<RemoteDialog>> {
        Ok(self.behaviour.dialogs.iter().take(limit).cloned().collect())
    }

    async fn iter_messages(&self, peer: PeerId, limit: usize) -> Result<Vec<RemoteMessage>> {
        // Newest first, like the service returns them.
        let mut history: Vec<RemoteMessage> = self
            .behaviour
            .history
            .iter()
            .filter(|m| m.peer_id == peer)
            .cloned()
            .collect();
        history.sort_by_key(|m| std::cmp::Reverse((m.timestamp, m.message_id)));
        history.truncate(limit);
        Ok(history)
    }

    async fn send_message(&self, peer: PeerId, text: &str) -> Result<RemoteMessage> {
        if self.behaviour.fail_send {
            return Err(anyhow!("peer {} is not reachable", peer.0));
        }
        let mut sent = lock(&self.sent);
        sent.push((peer, text.to_string()));
        Ok(RemoteMessage {
            peer_id: peer,
            message_id: MessageId(1_000 + sent.len() as i64),
            text: Some(text.to_string()),
            timestamp: Utc::now(),
            outbound: true,
        })
    }

    fn subscribe_new_messages(&self) -> broadcast::Receiver<RemoteMessage> {
        self.inbound.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    behaviour: Mutex<Behaviour>,
    opened: Mutex<Vec<Arc<FakeClient>>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn with(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            ..Self::default()
        })
    }

    pub fn update(&self, change: impl FnOnce(&mut Behaviour)) {
        change(&mut lock(&self.behaviour));
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_client(&self) -> Arc<FakeClient> {
        lock(&self.opened)
            .last()
            .cloned()
            .expect("a client should have been opened")
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn open(&self, params: ConnectParams) -> Result<Arc<dyn RemoteClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behaviour = lock(&self.behaviour).clone();
        if !behaviour.connect_delay.is_zero() {
            tokio::time::sleep(behaviour.connect_delay).await;
        }
        if behaviour.fail_connect {
            return Err(anyhow!("network unreachable"));
        }
        let client = Arc::new(FakeClient::new(params, behaviour));
        lock(&self.opened).push(client.clone());
        Ok(client)
    }
}

/// `SessionStore` kept in a map, with the same merge rules as the sqlite store.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<Phone, PhoneSession>>,
    pub fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn record(&self, phone: &Phone) -> Option<PhoneSession> {
        lock(&self.records).get(phone).cloned()
    }

    pub fn seed(&self, phone: &Phone, credentials: Option<ApiCredentials>, blob: Option<&str>) {
        let now = Utc::now();
        lock(&self.records).insert(
            phone.clone(),
            PhoneSession {
                phone: phone.clone(),
                credentials,
                session_blob: blob.map(SessionBlob::new),
                last_active_at: None,
                created_at: now,
                updated_at: now,
            },
        );
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_session(&self, phone: &Phone) -> Result<Option<PhoneSession>> {
        Ok(self.record(phone))
    }

    async fn save_session(&self, phone: &Phone, update: SessionUpdate) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("disk I/O error"));
        }
        if update.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut records = lock(&self.records);
        let record = records.entry(phone.clone()).or_insert_with(|| PhoneSession {
            phone: phone.clone(),
            credentials: None,
            session_blob: None,
            last_active_at: None,
            created_at: now,
            updated_at: now,
        });
        if update.credentials.is_some() {
            record.credentials = update.credentials;
        }
        if update.session_blob.is_some() {
            record.session_blob = update.session_blob;
        }
        if update.last_active_at.is_some() {
            record.last_active_at = update.last_active_at;
        }
        record.updated_at = now;
        Ok(())
    }
}

pub(crate) fn person(id: i64, first: &str, last: Option<&str>) -> Peer {
    Peer::Person {
        id: PeerId(id),
        first_name: Some(first.to_string()),
        last_name: last.map(str::to_string),
        username: None,
    }
}
