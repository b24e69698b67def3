//! HTTP client wrapper.
//!
//! Wraps reqwest with:
//! - Proxies taken only from [`ProxySettings`], never from the environment
//! - Configurable timeouts
//! - Status checking that maps failures onto [`LauncherError`]

use crate::config::{NetworkConfig, ProxySettings};
use crate::error::{LauncherError, Result};
use reqwest::{Client, NoProxy, Proxy, Response};
use std::time::Duration;
use tracing::debug;

/// HTTP client used for one download or manifest operation.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a client with the default request timeout.
    pub fn new(proxy: &ProxySettings) -> Result<Self> {
        Self::with_timeout(proxy, NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a client with a custom overall request timeout.
    pub fn with_timeout(proxy: &ProxySettings, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .no_proxy();

        let no_proxy = proxy.no_proxy.as_deref().and_then(NoProxy::from_string);

        if let Some(ref url) = proxy.http {
            debug!("Using HTTP proxy {}", url);
            let http = Proxy::http(url).map_err(|e| LauncherError::Config {
                message: format!("Invalid HTTP proxy {}: {}", url, e),
            })?;
            builder = builder.proxy(http.no_proxy(no_proxy.clone()));
        }

        if let Some(ref url) = proxy.https {
            debug!("Using HTTPS proxy {}", url);
            let https = Proxy::https(url).map_err(|e| LauncherError::Config {
                message: format!("Invalid HTTPS proxy {}: {}", url, e),
            })?;
            builder = builder.proxy(https.no_proxy(no_proxy));
        }

        let client = builder
            .build()
            .map_err(|e| LauncherError::network("Failed to create HTTP client", &e))?;

        Ok(Self { client })
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Send a GET request and return the response regardless of status.
    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| LauncherError::network(&format!("Failed to fetch {}", url), &e))
    }

    /// Send a GET request, failing with `InvalidStatus` on a non-2xx response.
    pub async fn get_success(&self, url: &str) -> Result<Response> {
        let response = self.get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::InvalidStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}
