//! Heuristic detection of dangerous links in message text.
//!
//! Every URL found in a message is classified in priority order: denylisted
//! registrable domain, red-flag phrase in the URL, excessive length, and
//! finally a HEAD probe that follows redirects. Network trouble never fails
//! detection; an inconclusive probe simply leaves the URL unflagged.

use std::{
    collections::HashSet,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Result;
use futures::{stream::FuturesUnordered, StreamExt};
use regex::Regex;
use shared::protocol::{DangerAnnotation, DangerReason};
use tracing::debug;

mod domain;
mod probe;

pub use domain::{host_of, registrable_domain, registrable_name};
pub use probe::{DisabledProbe, HttpRedirectProbe, Landing, RedirectProbe};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_MESSAGE_DEADLINE: Duration = Duration::from_secs(6);
const DEFAULT_MAX_URL_LEN: usize = 100;

/// Registrable domains of link shorteners and known impersonators.
const DENYLISTED_DOMAINS: &[&str] = &["bit.ly", "tinyurl.com", "goo.gl", "t.ly"];
/// Impersonation names matched against the registrable domain without its suffix.
const DENYLISTED_NAMES: &[&str] = &["login-telegram", "telegram-support", "tg-premium"];

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

static RED_FLAG_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)login.*telegram",
        r"(?i)verify.*account",
        r"(?i)gift.*telegram",
        r"(?i)claim.*prize",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub probe_timeout: Duration,
    /// Upper bound on all probing for one message.
    pub message_deadline: Duration,
    pub max_url_len: usize,
    /// Name of the messaging service impersonated by phishing redirects.
    pub service_name: String,
    /// Path tokens that mark a redirect target as a legitimate invite.
    pub invite_tokens: Vec<String>,
    pub extra_denylist: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            message_deadline: DEFAULT_MESSAGE_DEADLINE,
            max_url_len: DEFAULT_MAX_URL_LEN,
            service_name: "telegram".into(),
            invite_tokens: vec!["join".into()],
            extra_denylist: Vec::new(),
        }
    }
}

pub struct LinkDangerDetector {
    config: DetectorConfig,
    denylisted_domains: HashSet<String>,
    denylisted_names: HashSet<String>,
    probe: Arc<dyn RedirectProbe>,
}

impl LinkDangerDetector {
    pub fn new(config: DetectorConfig, probe: Arc<dyn RedirectProbe>) -> Self {
        let mut denylisted_domains: HashSet<String> =
            DENYLISTED_DOMAINS.iter().map(|d| d.to_string()).collect();
        let mut denylisted_names: HashSet<String> =
            DENYLISTED_NAMES.iter().map(|d| d.to_string()).collect();
        for entry in &config.extra_denylist {
            let entry = entry.trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('.') {
                denylisted_domains.insert(entry);
            } else {
                denylisted_names.insert(entry);
            }
        }

        Self {
            config,
            denylisted_domains,
            denylisted_names,
            probe,
        }
    }

    pub fn with_http_probe(config: DetectorConfig) -> Result<Self> {
        let probe = HttpRedirectProbe::new(config.probe_timeout)?;
        Ok(Self::new(config, Arc::new(probe)))
    }

    pub fn offline(config: DetectorConfig) -> Self {
        Self::new(config, Arc::new(DisabledProbe))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Scans `text` and returns one annotation per flagged URL, in the order
    /// the URLs appear.
    pub async fn detect(&self, text: Option<&str>) -> Vec<DangerAnnotation> {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return Vec::new();
        };
        let urls = extract_urls(text);
        if urls.is_empty() {
            return Vec::new();
        }

        let mut verdicts: Vec<Option<DangerReason>> =
            urls.iter().map(|url| self.classify_offline(url)).collect();

        let mut probes: FuturesUnordered<_> = verdicts
            .iter()
            .enumerate()
            .filter(|(_, verdict)| verdict.is_none())
            .map(|(idx, _)| {
                let url = urls[idx];
                async move { (idx, self.probe_redirect(url).await) }
            })
            .collect();

        let mut remaining = probes.len();
        if remaining > 0 {
            let deadline = tokio::time::sleep(self.config.message_deadline);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    next = probes.next() => match next {
                        Some((idx, verdict)) => {
                            verdicts[idx] = verdict;
                            remaining -= 1;
                        }
                        None => break,
                    },
                    _ = &mut deadline => {
                        debug!(
                            pending = remaining,
                            "link classification deadline elapsed; leaving remaining urls unflagged"
                        );
                        break;
                    }
                }
            }
        }

        urls.into_iter()
            .zip(verdicts)
            .filter_map(|(url, verdict)| {
                verdict.map(|reason| DangerAnnotation {
                    url: url.to_string(),
                    reason,
                })
            })
            .collect()
    }

    /// The checks that need no network: denylist, red-flag phrases, length.
    pub fn classify_offline(&self, url: &str) -> Option<DangerReason> {
        if let Some(host) = host_of(url) {
            let registrable = registrable_domain(&host);
            if self.denylisted_domains.contains(&registrable)
                || self
                    .denylisted_names
                    .contains(registrable_name(&registrable))
            {
                return Some(DangerReason::SuspiciousDomain);
            }
        }

        if RED_FLAG_PATTERNS.iter().any(|re| re.is_match(url)) {
            return Some(DangerReason::SuspiciousPattern);
        }

        if url.chars().count() > self.config.max_url_len {
            return Some(DangerReason::LongUrl);
        }

        None
    }

    async fn probe_redirect(&self, url: &str) -> Option<DangerReason> {
        match tokio::time::timeout(self.config.probe_timeout, self.probe.probe(url)).await {
            Ok(Ok(landing)) => self.judge_landing(&landing),
            Ok(Err(error)) => {
                debug!(%url, error = %format!("{error:#}"), "redirect probe inconclusive");
                None
            }
            Err(_) => {
                debug!(%url, "redirect probe timed out");
                None
            }
        }
    }

    fn judge_landing(&self, landing: &Landing) -> Option<DangerReason> {
        let service = self.config.service_name.to_ascii_lowercase();
        let mut targets = Vec::with_capacity(2);
        if landing.redirected {
            targets.push(landing.final_url.to_ascii_lowercase());
        }
        if let Some(location) = &landing.location {
            targets.push(location.to_ascii_lowercase());
        }

        targets
            .iter()
            .any(|target| {
                target.contains(&service)
                    && !self
                        .config
                        .invite_tokens
                        .iter()
                        .any(|token| target.contains(&token.to_ascii_lowercase()))
            })
            .then_some(DangerReason::SuspiciousRedirect)
    }
}

/// Scheme-anchored URL candidates in first-seen order.
pub fn extract_urls(text: &str) -> Vec<&str> {
    URL_PATTERN.find_iter(text).map(|m| m.as_str()).collect()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
