use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{ApiCredentials, Phone, SessionBlob};

/// Durable per-phone record used to resume remote sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhoneSession {
    pub phone: Phone,
    #[serde(skip)]
    pub credentials: Option<ApiCredentials>,
    #[serde(skip)]
    pub session_blob: Option<SessionBlob>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhoneSession {
    pub fn has_session_blob(&self) -> bool {
        self.session_blob.as_ref().is_some_and(|b| !b.is_empty())
    }
}

/// Fields to merge into a [`PhoneSession`]; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub credentials: Option<ApiCredentials>,
    pub session_blob: Option<SessionBlob>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    pub fn credentials(mut self, credentials: ApiCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn session_blob(mut self, blob: SessionBlob) -> Self {
        self.session_blob = Some(blob);
        self
    }

    pub fn touched_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_active_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_none() && self.session_blob.is_none() && self.last_active_at.is_none()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, phone: &Phone) -> Result<Option<PhoneSession>>;
    async fn save_session(&self, phone: &Phone, update: SessionUpdate) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<PhoneSession>> {
        let rows = sqlx::query(
            "SELECT phone, api_id, api_secret, session_blob, last_active_at, created_at, updated_at
             FROM phone_sessions
             ORDER BY phone ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list phone sessions")?;
        rows.iter().map(session_from_row).collect()
    }

    /// Administrative removal; the session core never deletes records itself.
    pub async fn delete_session(&self, phone: &Phone) -> Result<bool> {
        let result = sqlx::query("DELETE FROM phone_sessions WHERE phone = ?")
            .bind(phone.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete session for {phone}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStore for Storage {
    async fn load_session(&self, phone: &Phone) -> Result<Option<PhoneSession>> {
        let row = sqlx::query(
            "SELECT phone, api_id, api_secret, session_blob, last_active_at, created_at, updated_at
             FROM phone_sessions
             WHERE phone = ?",
        )
        .bind(phone.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load session for {phone}"))?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_session(&self, phone: &Phone, update: SessionUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let (api_id, api_secret) = match &update.credentials {
            Some(creds) => (Some(creds.api_id), Some(creds.api_secret.as_str())),
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO phone_sessions (phone, api_id, api_secret, session_blob, last_active_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(phone) DO UPDATE SET
                api_id = COALESCE(excluded.api_id, phone_sessions.api_id),
                api_secret = COALESCE(excluded.api_secret, phone_sessions.api_secret),
                session_blob = COALESCE(excluded.session_blob, phone_sessions.session_blob),
                last_active_at = COALESCE(excluded.last_active_at, phone_sessions.last_active_at),
                updated_at = excluded.updated_at",
        )
        .bind(phone.as_str())
        .bind(api_id)
        .bind(api_secret)
        .bind(update.session_blob.as_ref().map(SessionBlob::as_str))
        .bind(update.last_active_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save session for {phone}"))?;

        debug!(
            %phone,
            credentials = update.credentials.is_some(),
            session_blob = update.session_blob.is_some(),
            "phone session saved"
        );
        Ok(())
    }
}

fn session_from_row(row: &SqliteRow) -> Result<PhoneSession> {
    let raw_phone: String = row.try_get("phone")?;
    let phone = Phone::parse(&raw_phone)
        .with_context(|| format!("stored phone '{raw_phone}' is malformed"))?;
    let api_id: Option<i32> = row.try_get("api_id")?;
    let api_secret: Option<String> = row.try_get("api_secret")?;
    let credentials = match (api_id, api_secret) {
        (Some(api_id), Some(api_secret)) => Some(ApiCredentials { api_id, api_secret }),
        _ => None,
    };
    let session_blob = row
        .try_get::<Option<String>, _>("session_blob")?
        .filter(|blob| !blob.is_empty())
        .map(SessionBlob::new);

    Ok(PhoneSession {
        phone,
        credentials,
        session_blob,
        last_active_at: row.try_get("last_active_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
