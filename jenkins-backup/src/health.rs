//! Health signal: poll an HTTP endpoint until it answers 2xx or a deadline passes.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shortest time a single probe is given, even right at the deadline
const MIN_PROBE_TIME: Duration = Duration::from_millis(100);

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// One probe of the service
    async fn probe(&self) -> bool;

    /// Probe every `interval` until healthy or `timeout` elapses
    async fn wait_until_healthy(&self, timeout: Duration, interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            ticker.tick().await;
            attempts += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let healthy = tokio::time::timeout(remaining.max(MIN_PROBE_TIME), self.probe())
                .await
                .unwrap_or(false);
            if healthy {
                info!(attempts, "Service is healthy");
                return true;
            }

            if Instant::now() >= deadline {
                warn!(attempts, timeout_secs = timeout.as_secs(), "Service did not become healthy");
                return false;
            }
        }
    }
}

/// GET a URL; any 2xx after redirects is healthy
pub struct HttpHealthChecker {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthChecker {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(url = %self.url, status = %resp.status(), "Health probe not ready");
                false
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Health probe failed");
                false
            }
        }
    }
}
