//! Host and registrable-domain extraction.
//!
//! This is an approximation of the public suffix list, not the full list:
//! only the multi-label suffixes below are known, and every other host is
//! assumed to end in a single-label suffix. A host under an unlisted
//! multi-label suffix (`example.gov.pl`) therefore resolves one label too
//! short (`gov.pl`). The denylist entries only need the common cases.

use std::net::IpAddr;

use url::Url;

/// Public suffixes made of more than one label. Anything else is treated as a
/// single-label suffix (`com`, `ly`, `io`, ...).
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.uk", "gov.uk", "me.uk", "org.uk", "ltd.uk", "plc.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au",
    "co.nz", "org.nz", "net.nz",
    "co.jp", "ne.jp", "or.jp",
    "co.kr", "or.kr",
    "co.in", "net.in", "org.in",
    "co.za", "org.za",
    "co.id", "co.il", "co.th",
    "com.ar", "com.br", "com.cn", "com.hk", "com.mx", "com.my", "com.pk",
    "com.sg", "com.tr", "com.tw", "com.ua", "com.vn",
    "net.br", "org.br",
    "github.io", "gitlab.io", "netlify.app", "vercel.app", "pages.dev",
    "blogspot.com", "herokuapp.com", "appspot.com", "web.app", "firebaseapp.com",
];

/// Lowercased host of `raw_url`, without a trailing dot.
pub fn host_of(raw_url: &str) -> Option<String> {
    let url = Url::parse(raw_url).ok()?;
    let host = url.host_str()?;
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Strips subdomains, keeping the registrable part (`a.b.example.co.uk` →
/// `example.co.uk`). IP literals and single-label hosts are returned as-is.
pub fn registrable_domain(host: &str) -> String {
    let host = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }

    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }

    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if MULTI_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len() - keep..].join(".")
}

/// The registrable domain minus its public suffix (`login-telegram.co.uk` →
/// `login-telegram`).
pub fn registrable_name(registrable: &str) -> &str {
    registrable.split('.').next().unwrap_or(registrable)
}
