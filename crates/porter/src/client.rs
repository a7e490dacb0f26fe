//! HTTP client construction for long-lived transfers.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::TransferError;

const DEFAULT_USER_AGENT: &str = concat!("porter/", env!("CARGO_PKG_VERSION"));

/// Configurable options for transfer clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Overall per-request timeout. `ZERO` leaves the request unbounded,
    /// which is the right default for multi-gigabyte transfers.
    pub timeout: Duration,
    /// Connection-establishment timeout.
    pub connect_timeout: Duration,
    /// Keep-alive pool size per host. Long chunked uploads depend on
    /// connection reuse; a fresh connection per chunk doubles tail latency.
    pub pool_max_idle_per_host: usize,
    /// User agent string.
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 5,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl ClientOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }
}

/// Create a reqwest `Client` with the provided options.
pub fn build_client(options: &ClientOptions) -> Result<Client, TransferError> {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );

    let mut builder = Client::builder()
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .user_agent(&options.user_agent)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10));

    if !options.timeout.is_zero() {
        builder = builder.timeout(options.timeout);
    }

    if !options.connect_timeout.is_zero() {
        builder = builder.connect_timeout(options.connect_timeout);
    }

    builder.build().map_err(TransferError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_unbounded() {
        let options = ClientOptions::default();
        assert!(options.timeout.is_zero());
        assert_eq!(options.pool_max_idle_per_host, 5);
    }

    #[test]
    fn test_build_client_with_timeout() {
        let options = ClientOptions::default().with_timeout_ms(5_000);
        assert!(build_client(&options).is_ok());
    }
}
