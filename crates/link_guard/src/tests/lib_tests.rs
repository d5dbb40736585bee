use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Mutex};

#[derive(Default)]
struct ScriptedProbe {
    landings: HashMap<String, Landing>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    fn redirect(mut self, from: &str, to: &str) -> Self {
        self.landings.insert(
            from.to_string(),
            Landing {
                final_url: to.to_string(),
                redirected: true,
                location: None,
            },
        );
        self
    }

    fn slow(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl RedirectProbe for ScriptedProbe {
    async fn probe(&self, url: &str) -> anyhow::Result<Landing> {
        self.calls.lock().expect("calls").push(url.to_string());
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        self.landings
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

fn detector_with(probe: Arc<ScriptedProbe>) -> LinkDangerDetector {
    LinkDangerDetector::new(DetectorConfig::default(), probe)
}

#[tokio::test]
async fn shortener_domain_is_flagged() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let dangers = detector.detect(Some("visit http://bit.ly/x")).await;
    assert_eq!(
        dangers,
        vec![DangerAnnotation {
            url: "http://bit.ly/x".into(),
            reason: DangerReason::SuspiciousDomain,
        }]
    );
    assert_eq!(
        dangers[0].reason.to_string(),
        "known suspicious / shortener domain"
    );
}

#[tokio::test]
async fn subdomains_of_denylisted_domains_are_flagged() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let dangers = detector
        .detect(Some("see https://promo.tinyurl.com/abc now"))
        .await;
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].reason, DangerReason::SuspiciousDomain);
}

#[tokio::test]
async fn impersonation_name_matches_any_suffix() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let dangers = detector
        .detect(Some("https://www.telegram-support.co.uk/help"))
        .await;
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].reason, DangerReason::SuspiciousDomain);
}

#[tokio::test]
async fn plain_text_and_empty_input_yield_nothing() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    assert!(detector.detect(Some("hello world")).await.is_empty());
    assert!(detector.detect(Some("")).await.is_empty());
    assert!(detector.detect(None).await.is_empty());
}

#[tokio::test]
async fn red_flag_phrase_is_case_insensitive() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let dangers = detector
        .detect(Some("https://example.com/LOGIN/Telegram-now"))
        .await;
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].reason, DangerReason::SuspiciousPattern);
}

#[tokio::test]
async fn domain_rule_wins_over_pattern_rule() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let dangers = detector
        .detect(Some("https://bit.ly/claim-your-prize"))
        .await;
    assert_eq!(dangers[0].reason, DangerReason::SuspiciousDomain);
}

#[tokio::test]
async fn long_url_without_other_trigger_is_flagged_without_probing() {
    let probe = Arc::new(ScriptedProbe::default());
    let detector = detector_with(probe.clone());
    let base = "https://example.com/";
    let url = format!("{base}{}", "a".repeat(150 - base.len()));
    assert_eq!(url.len(), 150);

    let dangers = detector.detect(Some(&format!("look: {url}"))).await;
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].url, url);
    assert_eq!(
        dangers[0].reason.to_string(),
        "very long URL (possible obfuscation)"
    );
    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn redirect_to_service_without_invite_is_flagged() {
    let probe = Arc::new(
        ScriptedProbe::default()
            .redirect("https://short.example/a", "https://telegram.example.net/auth")
            .redirect("https://short.example/b", "https://t.me/joinchat/abc?telegram=1"),
    );
    let detector = detector_with(probe.clone());
    let dangers = detector
        .detect(Some(
            "first https://short.example/a then https://short.example/b",
        ))
        .await;

    assert_eq!(
        dangers,
        vec![DangerAnnotation {
            url: "https://short.example/a".into(),
            reason: DangerReason::SuspiciousRedirect,
        }]
    );
    assert_eq!(probe.calls().len(), 2);
}

#[tokio::test]
async fn unredirected_service_link_is_not_flagged() {
    let mut probe = ScriptedProbe::default();
    probe.landings.insert(
        "https://telegram.org/".into(),
        Landing {
            final_url: "https://telegram.org/".into(),
            redirected: false,
            location: None,
        },
    );
    let detector = detector_with(Arc::new(probe));
    assert!(detector
        .detect(Some("https://telegram.org/"))
        .await
        .is_empty());
}

#[tokio::test]
async fn probe_failures_degrade_to_no_flag() {
    let probe = Arc::new(ScriptedProbe::default());
    let detector = detector_with(probe.clone());
    let dangers = detector
        .detect(Some("https://unreachable.example/x and http://bit.ly/y"))
        .await;
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].url, "http://bit.ly/y");
    assert_eq!(probe.calls(), vec!["https://unreachable.example/x"]);
}

#[tokio::test(start_paused = true)]
async fn message_deadline_bounds_slow_probes() {
    let probe = Arc::new(
        ScriptedProbe::default()
            .redirect("https://fast.example/", "https://telegram.example/login")
            .redirect("https://slow.example/", "https://telegram.example/login")
            .slow("https://slow.example/", Duration::from_secs(30)),
    );
    let config = DetectorConfig {
        probe_timeout: Duration::from_secs(20),
        message_deadline: Duration::from_secs(2),
        ..DetectorConfig::default()
    };
    let detector = LinkDangerDetector::new(config, probe);

    let started = tokio::time::Instant::now();
    let dangers = detector
        .detect(Some("https://slow.example/ https://fast.example/"))
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(dangers.len(), 1);
    assert_eq!(dangers[0].url, "https://fast.example/");
}

#[tokio::test(start_paused = true)]
async fn per_url_timeout_applies() {
    let probe = Arc::new(
        ScriptedProbe::default()
            .redirect("https://slow.example/", "https://telegram.example/login")
            .slow("https://slow.example/", Duration::from_secs(30)),
    );
    let config = DetectorConfig {
        probe_timeout: Duration::from_secs(4),
        message_deadline: Duration::from_secs(60),
        ..DetectorConfig::default()
    };
    let detector = LinkDangerDetector::new(config, probe);

    let started = tokio::time::Instant::now();
    assert!(detector
        .detect(Some("https://slow.example/"))
        .await
        .is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn preserves_first_seen_order_across_rules() {
    let detector = LinkDangerDetector::offline(DetectorConfig::default());
    let text = "a https://example.com/verify-your-account b http://goo.gl/q c https://safe.example/";
    let dangers = detector.detect(Some(text)).await;
    let urls: Vec<&str> = dangers.iter().map(|d| d.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["https://example.com/verify-your-account", "http://goo.gl/q"]
    );
}

#[tokio::test]
async fn extra_denylist_entries_are_honoured() {
    let config = DetectorConfig {
        extra_denylist: vec!["Evil.Example".into(), "gram-gift".into()],
        ..DetectorConfig::default()
    };
    let detector = LinkDangerDetector::offline(config);
    let dangers = detector
        .detect(Some("https://x.evil.example/ https://gram-gift.net/"))
        .await;
    assert_eq!(dangers.len(), 2);
    assert!(dangers
        .iter()
        .all(|d| d.reason == DangerReason::SuspiciousDomain));
}

#[test]
fn unlisted_multi_label_suffix_falls_back_to_one_label() {
    assert_eq!(registrable_domain("shop.example.co.uk"), "example.co.uk");
    assert_eq!(registrable_domain("shop.example.gov.pl"), "gov.pl");
}

#[test]
fn registrable_domain_is_suffix_aware() {
    assert_eq!(registrable_domain("a.b.example.com"), "example.com");
    assert_eq!(registrable_domain("news.bbc.co.uk"), "bbc.co.uk");
    assert_eq!(registrable_domain("bit.ly"), "bit.ly");
    assert_eq!(registrable_domain("127.0.0.1"), "127.0.0.1");
    assert_eq!(registrable_domain("Example.COM."), "example.com");
}

#[test]
fn extract_urls_is_scheme_anchored() {
    let urls = extract_urls("go to www.example.com or https://a.example/x?y=1, ftp://b");
    assert_eq!(urls, vec!["https://a.example/x?y=1,"]);
}
