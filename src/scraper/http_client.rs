use super::UpstreamError;
use crate::config::ScraperConfig;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub struct HttpClient {
    inner: reqwest::Client,
    max_retries: u32,
    retry_backoff: Duration,
    jitter_ms: u64,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self, UpstreamError> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        Ok(Self {
            inner,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            jitter_ms: config.jitter_ms,
        })
    }

    /// Fetch a URL as text with retry on transient failures. Rate-limit
    /// responses (429/503) back off exponentially, other client errors fail
    /// immediately.
    pub async fn get_text(&self, url: &str) -> Result<String, UpstreamError> {
        let mut last_err = UpstreamError::Fetch {
            url: url.to_string(),
            message: "no attempts made".to_string(),
        };

        for attempt in 1..=(self.max_retries + 1) {
            debug!("GET {} (attempt {})", url, attempt);

            match self.inner.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.text().await.map_err(|e| UpstreamError::Fetch {
                            url: url.to_string(),
                            message: format!("failed to read response body: {e}"),
                        });
                    }

                    if status.as_u16() == 429 || status.as_u16() == 503 {
                        let backoff = self.retry_backoff * 2u32.pow(attempt) + self.jitter();
                        warn!("rate limited ({}) on attempt {}, sleeping {:?}", status, attempt, backoff);
                        sleep(backoff).await;
                        last_err = UpstreamError::Status { status: status.as_u16(), url: url.to_string() };
                    } else {
                        // Other 4xx/5xx responses are not retried.
                        return Err(UpstreamError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                }
                Err(e) => {
                    last_err = UpstreamError::Fetch { url: url.to_string(), message: e.to_string() };
                    let backoff = self.retry_backoff * attempt + self.jitter();
                    warn!("request failed on attempt {}: {}", attempt, e);
                    sleep(backoff).await;
                }
            }
        }

        Err(last_err)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }
}
