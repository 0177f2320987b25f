//! The HTTP health probe used by the start-and-probe algorithm.

use std::time::Duration;

use async_trait::async_trait;

const DIAL_TIMEOUT: Duration = Duration::from_millis(500);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction over "ask the backend if it's healthy yet", mockable the way
/// the teacher's `HealthChecker` trait is mocked in its supervisor tests.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(&self) -> bool;
}

/// Probes a URL once and classifies any 2xx response as healthy, matching
/// the "empty healthy-status-codes list means any 2xx" default from the
/// teacher's `HttpHealthChecker`. This spec has no per-model override list,
/// so 2xx is the only healthy signal.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthChecker {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .expect("reqwest client with fixed timeouts should always build");
        Self { client, url }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check_health(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn two_hundred_is_healthy() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(200);
        });
        let checker = HttpHealthChecker::new(server.url("/healthz"));
        assert!(checker.check_health().await);
        mock.assert();
    }

    #[tokio::test]
    async fn five_hundred_is_unhealthy() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/healthz");
            then.status(500);
        });
        let checker = HttpHealthChecker::new(server.url("/healthz"));
        assert!(!checker.check_health().await);
    }

    #[tokio::test]
    async fn connection_refused_is_unhealthy() {
        let checker = HttpHealthChecker::new("http://127.0.0.1:1".to_string());
        assert!(!checker.check_health().await);
    }
}
