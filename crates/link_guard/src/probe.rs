use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::LOCATION, redirect::Policy, Client};
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// Where a HEAD request for a URL ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landing {
    pub final_url: String,
    pub redirected: bool,
    /// `Location` header still present on the final response, if any.
    pub location: Option<String>,
}

#[async_trait]
pub trait RedirectProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<Landing>;
}

pub struct HttpRedirectProbe {
    http: Client,
}

impl HttpRedirectProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build redirect probe client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RedirectProbe for HttpRedirectProbe {
    async fn probe(&self, url: &str) -> Result<Landing> {
        let requested = Url::parse(url).with_context(|| format!("unparseable url '{url}'"))?;
        let response = self
            .http
            .head(requested.clone())
            .send()
            .await
            .with_context(|| format!("HEAD {url} failed"))?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().clone();

        Ok(Landing {
            redirected: final_url != requested,
            final_url: final_url.to_string(),
            location,
        })
    }
}

/// Probe used when outbound network checks are turned off.
pub struct DisabledProbe;

#[async_trait]
impl RedirectProbe for DisabledProbe {
    async fn probe(&self, _url: &str) -> Result<Landing> {
        Err(anyhow!("redirect probing is disabled"))
    }
}
