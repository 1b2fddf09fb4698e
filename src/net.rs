//! HTTP clients for index queries and artifact downloads.

use crate::config::SourceConfig;
use crate::core::{ProvisionError, ProvisionResult};
use reqwest::{header, Client, Url};
use std::time::Duration;

const USER_AGENT: &str = concat!("provision/", env!("CARGO_PKG_VERSION"));

/// A verifying client plus, when trusted hosts are configured, a client that
/// skips TLS certificate checks for those hosts only.
#[derive(Clone)]
pub struct HttpClients {
    verifying: Client,
    trusting: Option<Client>,
    trusted_hosts: Vec<String>,
}

impl HttpClients {
    pub fn new(sources: &SourceConfig, timeout: Duration) -> ProvisionResult<Self> {
        let verifying = build_client(timeout, false)?;
        let trusting = if sources.trusted_hosts.is_empty() {
            None
        } else {
            Some(build_client(timeout, true)?)
        };

        Ok(Self {
            verifying,
            trusting,
            trusted_hosts: sources
                .trusted_hosts
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
        })
    }

    /// Client to use for `url`, chosen by host.
    pub fn for_url(&self, url: &str) -> &Client {
        match (&self.trusting, host_of(url)) {
            (Some(trusting), Some(host)) if self.trusted_hosts.contains(&host) => trusting,
            _ => &self.verifying,
        }
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        self.trusting.is_some()
            && host_of(url)
                .map(|h| self.trusted_hosts.contains(&h))
                .unwrap_or(false)
    }
}

fn build_client(timeout: Duration, accept_invalid_certs: bool) -> ProvisionResult<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        header::HeaderValue::from_static(USER_AGENT),
    );

    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| ProvisionError::Config(format!("Failed to create HTTP client: {}", e)))
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
