//! Completion and embedding services plus the gateway that calls them.
//!
//! Two async traits describe the external services:
//! - [`CompletionService`]: prompt in, text out (expected to hold JSON).
//! - [`EmbeddingService`]: texts in, fixed-dimension vectors out.
//!
//! Implementations:
//! - [`DisabledService`]: fails every call with [`ServiceError::Disabled`];
//!   used for offline, native-only runs.
//! - [`OpenAiCompletion`] / [`OpenAiEmbedding`]: OpenAI HTTP APIs over `reqwest`.
//!
//! All calls go through [`ServiceGateway`], which bounds concurrency with a
//! semaphore, applies a per-call timeout, retries transient failures with
//! exponential backoff and aborts as soon as the run is cancelled.

use crate::config::{CompletionConfig, EmbeddingConfig, ServiceConfig};
use crate::error::ServiceError;
use anyhow::bail;
use async_trait::async_trait;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// What a completion request is for. Lets stubs and logs tell calls apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Classification,
    Extraction,
    Enrichment,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    pub system: String,
    pub prompt: String,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn model_name(&self) -> &str;

    /// Dimensionality every returned vector must have.
    fn dims(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

// ============ Disabled ============

/// Service that is not configured. Every call fails permanently.
pub struct DisabledService;

#[async_trait]
impl CompletionService for DisabledService {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ServiceError> {
        Err(ServiceError::Disabled)
    }
}

#[async_trait]
impl EmbeddingService for DisabledService {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Err(ServiceError::Disabled)
    }
}

// ============ OpenAI ============

fn api_key_from_env(var: &str) -> anyhow::Result<String> {
    match std::env::var(var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => bail!("{} environment variable not set", var),
    }
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout(timeout)
    } else {
        ServiceError::Transport(e.to_string())
    }
}

/// Map a non-success HTTP status to a service error.
///
/// 429 is rate limiting and 5xx a server error (both retried); any other
/// client error is a permanent rejection.
fn status_error(status: reqwest::StatusCode, body: String) -> ServiceError {
    if status.as_u16() == 429 {
        ServiceError::RateLimited(body)
    } else if status.is_server_error() {
        ServiceError::Server {
            status: status.as_u16(),
            message: body,
        }
    } else {
        ServiceError::Rejected(format!("{}: {}", status, body))
    }
}

/// Chat completion over the OpenAI API.
pub struct OpenAiCompletion {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompletion {
    pub fn new(config: &CompletionConfig, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: api_key_from_env(&config.api_key_env)?,
            timeout,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string())
            .ok_or_else(|| {
                ServiceError::Rejected("completion response has no message content".to_string())
            })
    }
}

/// Embeddings over the OpenAI API.
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    dims: usize,
    timeout: Duration,
}

impl OpenAiEmbedding {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> anyhow::Result<Self> {
        if config.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        Ok(Self {
            client: http_client(timeout)?,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: api_key_from_env(&config.api_key_env)?,
            dims: config.dims,
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedding {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        parse_embedding_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ServiceError::Rejected("embedding response has no data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ServiceError::Rejected("embedding item has no vector".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Instantiate the completion service named by `config.provider`.
pub fn create_completion_service(
    config: &CompletionConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn CompletionService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledService)),
        "openai" => Ok(Arc::new(OpenAiCompletion::new(config, timeout)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

/// Instantiate the embedding service named by `config.provider`.
pub fn create_embedding_service(
    config: &EmbeddingConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledService)),
        "openai" => Ok(Arc::new(OpenAiEmbedding::new(config, timeout)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Gateway ============

/// Timeout and retry settings for every gateway call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_input_chars: usize,
}

impl From<&ServiceConfig> for CallPolicy {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_input_chars: config.max_input_chars,
        }
    }
}

/// Longest delay between two attempts of one call.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

impl CallPolicy {
    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base, ...
    /// capped at five minutes.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .checked_mul(1u32 << attempt.min(5))
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }
}

/// Shared entry point for every outbound service call of a run.
pub struct ServiceGateway {
    completion: Arc<dyn CompletionService>,
    embedding: Arc<dyn EmbeddingService>,
    permits: Semaphore,
    policy: CallPolicy,
    cancel: CancellationToken,
}

impl ServiceGateway {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        embedding: Arc<dyn EmbeddingService>,
        concurrency_limit: usize,
        policy: CallPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            completion,
            embedding,
            permits: Semaphore::new(concurrency_limit.max(1)),
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    pub fn embedding_dims(&self) -> usize {
        self.embedding.dims()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
        debug!(
            "Completion call ({:?}, {} chars) via {}",
            request.purpose,
            request.prompt.len(),
            self.completion.model_name()
        );
        self.call(|| self.completion.complete(request)).await
    }

    /// Embed `texts`; the result has exactly one vector per input.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let vectors = self.call(|| self.embedding.embed(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(ServiceError::Rejected(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, ServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            // a permit per attempt, so backoff sleeps do not occupy a slot
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ServiceError::Cancelled),
                permit = self.permits.acquire() => permit.map_err(|_| ServiceError::Cancelled)?,
            };
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ServiceError::Cancelled),
                result = tokio::time::timeout(self.policy.timeout, op()) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ServiceError::Timeout(self.policy.timeout)),
                },
            };
            drop(permit);

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Service call failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt + 1,
                        self.policy.max_retries,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(ServiceError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedCompletion {
        script: Mutex<Vec<Result<String, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedCompletion {
        fn new(mut script: Vec<Result<String, ServiceError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    struct SlowCompletion {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl CompletionService for SlowCompletion {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".to_string())
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            max_input_chars: 24_000,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            purpose: Purpose::Enrichment,
            system: "system".into(),
            prompt: "prompt".into(),
        }
    }

    fn gateway(completion: Arc<dyn CompletionService>, limit: usize) -> ServiceGateway {
        ServiceGateway::new(
            completion,
            Arc::new(DisabledService),
            limit,
            policy(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let stub = Arc::new(ScriptedCompletion::new(vec![
            Err(ServiceError::RateLimited("slow down".into())),
            Err(ServiceError::Server {
                status: 502,
                message: "bad gateway".into(),
            }),
            Ok("done".into()),
        ]));
        let gw = gateway(stub.clone(), 2);
        assert_eq!(gw.complete(&request()).await, Ok("done".to_string()));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_is_respected() {
        let stub = Arc::new(ScriptedCompletion::new(vec![
            Err(ServiceError::Transport("reset".into())),
            Err(ServiceError::Transport("reset".into())),
            Err(ServiceError::Transport("reset".into())),
            Err(ServiceError::Transport("reset".into())),
            Ok("too late".into()),
        ]));
        let gw = gateway(stub.clone(), 1);
        assert!(matches!(
            gw.complete(&request()).await,
            Err(ServiceError::Transport(_))
        ));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let stub = Arc::new(ScriptedCompletion::new(vec![Err(ServiceError::Rejected(
            "401".into(),
        ))]));
        let gw = gateway(stub.clone(), 1);
        assert!(matches!(
            gw.complete(&request()).await,
            Err(ServiceError::Rejected(_))
        ));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_service_fails_immediately() {
        let gw = gateway(Arc::new(DisabledService), 1);
        assert_eq!(gw.complete(&request()).await, Err(ServiceError::Disabled));
        assert_eq!(
            gw.embed(&["text".to_string()]).await,
            Err(ServiceError::Disabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let stub = Arc::new(SlowCompletion {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
        });
        let gw = gateway(stub, 1);
        assert_eq!(
            gw.complete(&request()).await,
            Err(ServiceError::Timeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let stub = Arc::new(SlowCompletion {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let gw = gateway(stub.clone(), 2);
        let req = request();
        let calls = (0..8).map(|_| gw.complete(&req));
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(stub.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_gateway_rejects_calls() {
        let cancel = CancellationToken::new();
        let stub = Arc::new(ScriptedCompletion::new(vec![Ok("never".into())]));
        let gw = ServiceGateway::new(
            stub.clone(),
            Arc::new(DisabledService),
            1,
            policy(),
            cancel.clone(),
        );
        cancel.cancel();
        assert_eq!(gw.complete(&request()).await, Err(ServiceError::Cancelled));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = CallPolicy {
            backoff_base: Duration::MAX,
            ..policy()
        };
        assert_eq!(p.backoff(4), MAX_BACKOFF);
        let p = CallPolicy {
            backoff_base: Duration::from_secs(60),
            ..policy()
        };
        assert_eq!(p.backoff(0), Duration::from_secs(60));
        assert_eq!(p.backoff(9), MAX_BACKOFF);
    }

    /// Rate-limits the prompt "flaky" once; records the prompts it answered.
    struct FlakyOnce {
        failed: AtomicUsize,
        answered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionService for FlakyOnce {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ServiceError> {
            if request.prompt == "flaky" && self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ServiceError::RateLimited("slow down".into()));
            }
            self.answered.lock().unwrap().push(request.prompt.clone());
            Ok("ok".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_releases_the_permit() {
        let stub = Arc::new(FlakyOnce {
            failed: AtomicUsize::new(0),
            answered: Mutex::new(Vec::new()),
        });
        let gw = gateway(stub.clone(), 1);
        let flaky = CompletionRequest {
            prompt: "flaky".into(),
            ..request()
        };
        let steady = CompletionRequest {
            prompt: "steady".into(),
            ..request()
        };

        let (a, b) = tokio::join!(gw.complete(&flaky), gw.complete(&steady));
        assert!(a.is_ok() && b.is_ok());
        // the steady call ran while the flaky one was backing off
        assert_eq!(*stub.answered.lock().unwrap(), vec!["steady", "flaky"]);
    }

    #[test]
    fn test_parse_embedding_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_embedding_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            ServiceError::RateLimited(_)
        ));
        assert!(status_error(reqwest::StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!status_error(reqwest::StatusCode::UNAUTHORIZED, String::new()).is_transient());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let config = CompletionConfig {
            provider: "mystery".into(),
            ..CompletionConfig::default()
        };
        assert!(create_completion_service(&config, Duration::from_secs(1)).is_err());
    }
}
