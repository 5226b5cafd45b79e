//! Retrying JSON fetcher shared by HTTP source clients.

use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

use crate::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("govmatch/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Query strings carry the API key; only scheme, host and path are printable.
pub fn redact_url(url: &Url) -> String {
    let mut printable = url.clone();
    printable.set_query(None);
    printable.set_fragment(None);
    printable.to_string()
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` and decode the body as JSON, retrying transient failures.
    pub async fn get_json(&self, source_id: &str, url: Url) -> Result<JsonValue, SourceError> {
        let printable = redact_url(&url);
        let span = info_span!("http_fetch", source_id, url = %printable);
        self.get_json_inner(url, printable).instrument(span).await
    }

    async fn get_json_inner(&self, url: Url, printable: String) -> Result<JsonValue, SourceError> {
        for attempt in 0..=self.backoff.max_retries {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|err| SourceError::Transport {
                            url: printable.clone(),
                            message: err.without_url().to_string(),
                        })?;
                        debug!(bytes = body.len(), "fetched response body");
                        return serde_json::from_slice(&body).map_err(|err| SourceError::Decode {
                            url: printable.clone(),
                            message: err.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retry_allowed {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying http status");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: printable,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retry_allowed {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, "retrying transport error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(SourceError::Transport {
                        url: printable,
                        message: err.without_url().to_string(),
                    });
                }
            }
        }

        Err(SourceError::Transport {
            url: printable,
            message: "retries exhausted".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn redacted_url_drops_the_api_key() {
        let url = Url::parse("https://api.sam.gov/opportunities/v2/search?api_key=secret&limit=5")
            .unwrap();
        let printable = redact_url(&url);
        assert_eq!(printable, "https://api.sam.gov/opportunities/v2/search");
        assert!(!printable.contains("secret"));
    }
}
