use std::{fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::Context;
use link_guard::DetectorConfig;
use serde::Deserialize;
use tracing::warn;

use crate::{hub::DEFAULT_SUBSCRIBER_QUEUE, registry::StaleSessionPolicy};

pub const SETTINGS_FILE: &str = "dashboard.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub dialog_limit: usize,
    pub subscriber_queue: usize,
    pub probe_enabled: bool,
    pub probe_timeout_ms: u64,
    pub classify_deadline_ms: u64,
    pub stale_session_policy: StaleSessionPolicy,
    pub link_denylist: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/sessions.db".into(),
            dialog_limit: 60,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            probe_enabled: true,
            probe_timeout_ms: 4_000,
            classify_deadline_ms: 6_000,
            stale_session_policy: StaleSessionPolicy::default(),
            link_denylist: Vec::new(),
        }
    }
}

impl Settings {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            message_deadline: Duration::from_millis(self.classify_deadline_ms),
            extra_denylist: self.link_denylist.clone(),
            ..DetectorConfig::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    database_url: Option<String>,
    dialog_limit: Option<usize>,
    subscriber_queue: Option<usize>,
    probe_enabled: Option<bool>,
    probe_timeout_ms: Option<u64>,
    classify_deadline_ms: Option<u64>,
    stale_session_policy: Option<StaleSessionPolicy>,
    link_denylist: Option<Vec<String>>,
}

/// Defaults, then `dashboard.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read settings file '{}'", path.display()));
        }
    }

    apply_env(&mut settings, env);
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.dialog_limit {
        settings.dialog_limit = v;
    }
    if let Some(v) = file_cfg.subscriber_queue {
        settings.subscriber_queue = v;
    }
    if let Some(v) = file_cfg.probe_enabled {
        settings.probe_enabled = v;
    }
    if let Some(v) = file_cfg.probe_timeout_ms {
        settings.probe_timeout_ms = v;
    }
    if let Some(v) = file_cfg.classify_deadline_ms {
        settings.classify_deadline_ms = v;
    }
    if let Some(v) = file_cfg.stale_session_policy {
        settings.stale_session_policy = v;
    }
    if let Some(v) = file_cfg.link_denylist {
        settings.link_denylist = v;
    }
}

fn apply_env(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = parsed(&env, "APP__DIALOG_LIMIT") {
        settings.dialog_limit = v;
    }
    if let Some(v) = parsed(&env, "APP__SUBSCRIBER_QUEUE") {
        settings.subscriber_queue = v;
    }
    if let Some(v) = parsed(&env, "APP__PROBE_ENABLED") {
        settings.probe_enabled = v;
    }
    if let Some(v) = parsed(&env, "APP__PROBE_TIMEOUT_MS") {
        settings.probe_timeout_ms = v;
    }
    if let Some(v) = parsed(&env, "APP__CLASSIFY_DEADLINE_MS") {
        settings.classify_deadline_ms = v;
    }

    if let Some(v) = env("APP__STALE_SESSION_POLICY") {
        match v.trim().to_ascii_lowercase().as_str() {
            "assume_password" => settings.stale_session_policy = StaleSessionPolicy::AssumePassword,
            "request_code" => settings.stale_session_policy = StaleSessionPolicy::RequestCode,
            other => warn!(value = other, "ignoring unknown APP__STALE_SESSION_POLICY"),
        }
    }

    if let Some(v) = env("APP__LINK_DENYLIST") {
        settings.link_denylist = v
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
