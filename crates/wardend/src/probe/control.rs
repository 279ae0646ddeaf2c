//! Blocking client for the engine's control API.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::Proxy;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_millis(500);
const LOOPBACK: &str = "127.0.0.1";

/// Failures talking to the control API or through the probe.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// The request could not be sent or completed.
    #[error("request to {url} failed: {source}")]
    Request {
        /// Target URL.
        url: String,
        /// Transport error.
        #[source]
        source: Arc<reqwest::Error>,
    },
    /// The endpoint answered with an error status.
    #[error("{url} answered HTTP {status}: {message}")]
    Status {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Error message reported by the endpoint.
        message: String,
    },
    /// The response body did not have the expected shape.
    #[error("unexpected response from {url}: {message}")]
    Decode {
        /// Target URL.
        url: String,
        /// Decoding failure.
        message: String,
    },
}

#[derive(Deserialize)]
struct DelayResponse {
    delay: u64,
}

#[derive(Deserialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug)]
struct ProxiedClient {
    mixed_port: u16,
    client: Client,
}

/// HTTP client for one engine instance's control API.
///
/// Requests routed through a probe's mixed inbound share one client per
/// inbound port; a new probe session on another port replaces it.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: Client,
    request_timeout: Duration,
    proxied: Arc<Mutex<Option<ProxiedClient>>>,
}

impl ControlClient {
    /// Builds a client whose requests are bounded by `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Request`] when the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self, ControlError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout.saturating_add(CONNECT_TIMEOUT))
            .no_proxy()
            .build()
            .map_err(|source| ControlError::Request {
                url: String::from("<client>"),
                source: Arc::new(source),
            })?;
        Ok(Self {
            client,
            request_timeout,
            proxied: Arc::new(Mutex::new(None)),
        })
    }

    /// Per-request bound handed to the engine for delay tests.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether the control API root answers on `port`.
    #[must_use]
    pub fn ping(&self, port: u16) -> bool {
        self.client
            .get(format!("http://{LOOPBACK}:{port}/"))
            .timeout(PING_TIMEOUT)
            .send()
            .is_ok_and(|response| response.status().is_success())
    }

    /// Asks the engine to measure the latency of `tag` against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] when the engine reports a failed test or the
    /// request itself fails.
    pub fn delay(&self, port: u16, tag: &str, url: &str) -> Result<u64, ControlError> {
        let endpoint = format!("http://{LOOPBACK}:{port}/proxies/{tag}/delay");
        let timeout_ms = self.request_timeout.as_millis().to_string();
        let response = self
            .client
            .get(&endpoint)
            .query(&[("timeout", timeout_ms.as_str()), ("url", url)])
            .send()
            .map_err(|source| request_error(&endpoint, source))?;
        let response = check_status(&endpoint, response)?;
        let body: DelayResponse = response.json().map_err(|error| ControlError::Decode {
            url: endpoint.clone(),
            message: error.to_string(),
        })?;
        Ok(body.delay)
    }

    /// Switches `selector` to route through `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] when the engine refuses the switch.
    pub fn select(&self, port: u16, selector: &str, tag: &str) -> Result<(), ControlError> {
        let endpoint = format!("http://{LOOPBACK}:{port}/proxies/{selector}");
        let response = self
            .client
            .put(&endpoint)
            .json(&json!({ "name": tag }))
            .send()
            .map_err(|source| request_error(&endpoint, source))?;
        check_status(&endpoint, response).map(drop)
    }

    /// Fetches `url` as JSON through the probe's mixed inbound.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] when the request fails or the body is not
    /// JSON.
    pub fn fetch_via_proxy(&self, mixed_port: u16, url: &str) -> Result<Value, ControlError> {
        let response = self
            .proxied_client(mixed_port)?
            .get(url)
            .send()
            .map_err(|source| request_error(url, source))?;
        check_status(url, response)?
            .json()
            .map_err(|error| ControlError::Decode {
                url: url.to_owned(),
                message: error.to_string(),
            })
    }
}

impl ControlClient {
    fn proxied_client(&self, mixed_port: u16) -> Result<Client, ControlError> {
        let mut slot = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = slot.as_ref().filter(|cached| cached.mixed_port == mixed_port) {
            return Ok(cached.client.clone());
        }
        let proxy_url = format!("http://{LOOPBACK}:{mixed_port}");
        let proxy = Proxy::all(&proxy_url).map_err(|source| request_error(&proxy_url, source))?;
        // Idle connections would outlive the probe process behind the port.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(0)
            .proxy(proxy)
            .build()
            .map_err(|source| request_error(&proxy_url, source))?;
        *slot = Some(ProxiedClient {
            mixed_port,
            client: client.clone(),
        });
        Ok(client)
    }

    #[cfg(test)]
    fn proxied_port(&self) -> Option<u16> {
        self.proxied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|cached| cached.mixed_port)
    }
}

fn request_error(url: &str, source: reqwest::Error) -> ControlError {
    ControlError::Request {
        url: url.to_owned(),
        source: Arc::new(source),
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, ControlError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<MessageResponse>()
        .map(|body| body.message)
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_owned());
    Err(ControlError::Status {
        url: url.to_owned(),
        status: status.as_u16(),
        message,
    })
}
