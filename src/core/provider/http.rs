use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::response::error_message;
use super::{
    BatchResult, GenerationResult, ProviderRequest, ProviderTransport, RequestFamily,
    VideoRequest, parse_batch_response, parse_generation_response,
};
use crate::core::config::ProviderConfig;
use crate::core::error::GenerationError;

/// Absolute URLs of the provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub text_to_image: Url,
    pub image_edit: Url,
    pub image_to_video: Url,
    pub video_batch: Option<Url>,
}

impl Endpoints {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .with_context(|| format!("invalid provider base_url '{}'", config.base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| {
            base.join(path.trim_start_matches('/'))
                .with_context(|| format!("invalid endpoint path '{}'", path))
        };
        Ok(Self {
            text_to_image: join(&config.text_to_image_path)?,
            image_edit: join(&config.image_edit_path)?,
            image_to_video: join(&config.image_to_video_path)?,
            video_batch: match config.video_batch_path.as_deref() {
                Some(path) if !path.trim().is_empty() => Some(join(path)?),
                _ => None,
            },
        })
    }

    pub fn for_family(&self, family: RequestFamily) -> &Url {
        match family {
            RequestFamily::TextToImage => &self.text_to_image,
            RequestFamily::ImageEdit => &self.image_edit,
            RequestFamily::ImageToVideo => &self.image_to_video,
        }
    }
}

/// Attempt budget for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to 50% jitter. `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.saturating_sub(1).min(8));
        let jitter_cap = (self.base_delay.as_millis() as u64 / 2).max(1);
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoBatchBody<'a> {
    jobs: &'a [VideoRequest],
    max_concurrency: usize,
}

pub struct HttpTransport {
    client: Client,
    endpoints: Endpoints,
    api_key: Option<String>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoints: Endpoints, api_key: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            endpoints,
            api_key,
            retry,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoints = Endpoints::from_config(config)?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            debug!(
                "No provider API key in ${}; sending unauthenticated requests",
                config.api_key_env
            );
        }
        let retry = RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_ms),
        };
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoints,
            api_key,
            retry,
            timeout,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn post_once<B: Serialize + ?Sized>(&self, url: &Url, body: &B) -> Result<Value, GenerationError> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let res = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.timeout.as_secs())
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;
        let status = res.status();
        let text = res.text().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.timeout.as_secs())
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;
        if !status.is_success() {
            return Err(GenerationError::ProviderRejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        serde_json::from_str(&text)
            .map_err(|_| GenerationError::malformed("response is not valid JSON"))
    }

    /// POSTs `body`, retrying transient failures within the attempt budget.
    async fn post_json<B: Serialize + ?Sized>(&self, url: &Url, body: &B) -> Result<Value, GenerationError> {
        let mut attempt = 1;
        loop {
            match self.post_once(url, body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Provider call to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        url, attempt, self.retry.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn submit(&self, request: &ProviderRequest) -> GenerationResult {
        let family = request.family();
        let url = self.endpoints.for_family(family);
        let body = request
            .body()
            .map_err(|e| GenerationError::missing_input(format!("unserializable request: {}", e)))?;
        let value = self.post_json(url, &body).await?;
        parse_generation_response(&value, family)
    }

    async fn submit_video_batch(
        &self,
        requests: &[VideoRequest],
        max_concurrency: usize,
    ) -> Option<Vec<BatchResult>> {
        let url = self.endpoints.video_batch.as_ref()?;
        let body = VideoBatchBody {
            jobs: requests,
            max_concurrency: max_concurrency.max(1),
        };
        let results = match self.post_json(url, &body).await {
            Ok(value) => parse_batch_response(&value, requests),
            Err(err) => requests.iter().map(|_| Err(err.clone())).collect(),
        };
        Some(
            requests
                .iter()
                .map(|r| r.node_id.clone())
                .zip(results)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: base.to_string(),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn endpoints_join_paths_under_base() {
        let endpoints = Endpoints::from_config(&config("http://localhost:3000/api")).unwrap();
        assert_eq!(
            endpoints.text_to_image.as_str(),
            "http://localhost:3000/api/generate/text-to-image"
        );
        assert_eq!(
            endpoints.video_batch.as_ref().map(Url::as_str),
            Some("http://localhost:3000/api/generate/video-batch")
        );
    }

    #[test]
    fn empty_batch_path_disables_batch_endpoint() {
        let mut cfg = config("http://localhost:3000/");
        cfg.video_batch_path = Some(String::new());
        let endpoints = Endpoints::from_config(&cfg).unwrap();
        assert!(endpoints.video_batch.is_none());
    }

    #[test]
    fn invalid_base_url_is_reported() {
        assert!(Endpoints::from_config(&config("not a url")).is_err());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        let first = policy.delay_for(1);
        let third = policy.delay_for(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(450));
    }
}
