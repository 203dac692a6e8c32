//! Protected LLM client.
//!
//! Chat and embed calls compose four stages around the network call:
//!
//! ```text
//! rate limiter → response cache → circuit breaker → retry → provider
//! ```
//!
//! Independently of the pipeline, a per-slow-tick call budget caps traffic.
//! The budget is taken at call start and refunded when the call fast-fails
//! at the rate limiter or the breaker before any network attempt was made.
//! Every outcome is counted in the metrics registry; callers treat any
//! non-`Ok` result as "no answer this tick" and continue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{CacheConfig, CircuitBreakerConfig, LlmConfig, RateLimitConfig};
use crate::health::{Healthcheck, HealthSample};
use crate::metrics::MetricsRegistry;
use crate::shutdown::CancelToken;
use crate::types::LlmError;

use super::cache::{fingerprint, CacheStats, ResponseCache};
use super::circuit_breaker::{BreakerSettings, CircuitBreakerRegistry};
use super::provider::{ChatMessage, LlmProvider, ProviderError};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryPolicy, Transient};

/// Dependency name the breaker tracks for the LLM service.
const LLM_DEPENDENCY: &str = "llm";

/// Operation classes used by the rate limiter and budget.
pub const OP_CHAT: &str = "chat";
pub const OP_EMBED: &str = "embed";

#[derive(Debug)]
struct BudgetInner {
    chat_remaining: u32,
    embed_remaining: u32,
}

/// Per-slow-tick call budget. Reset atomically at the top of each slow tick.
pub struct TickBudget {
    chat_limit: u32,
    embed_limit: u32,
    inner: Mutex<BudgetInner>,
}

impl TickBudget {
    pub fn new(chat_limit: u32, embed_limit: u32) -> Self {
        Self {
            chat_limit,
            embed_limit,
            inner: Mutex::new(BudgetInner {
                chat_remaining: chat_limit,
                embed_remaining: embed_limit,
            }),
        }
    }

    /// Restore both budgets to their configured limits.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.chat_remaining = self.chat_limit;
        inner.embed_remaining = self.embed_limit;
    }

    fn try_take(&self, operation: &str) -> bool {
        let mut inner = self.inner.lock();
        let slot = match operation {
            OP_CHAT => &mut inner.chat_remaining,
            _ => &mut inner.embed_remaining,
        };
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }

    fn refund(&self, operation: &str) {
        let mut inner = self.inner.lock();
        match operation {
            OP_CHAT => {
                inner.chat_remaining = (inner.chat_remaining + 1).min(self.chat_limit);
            }
            _ => {
                inner.embed_remaining = (inner.embed_remaining + 1).min(self.embed_limit);
            }
        }
    }

    /// `(chat_remaining, embed_remaining)`.
    pub fn remaining(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.chat_remaining, inner.embed_remaining)
    }
}

/// The shared LLM access layer. One instance per process.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    limiter: RateLimiter,
    cache: ResponseCache,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    budget: TickBudget,
    metrics: Arc<MetricsRegistry>,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        llm_config: LlmConfig,
        rate_config: &RateLimitConfig,
        cache_config: &CacheConfig,
        breaker_config: &CircuitBreakerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let limiter = RateLimiter::new();
        limiter.configure(OP_CHAT, rate_config.chat_rate, rate_config.chat_burst);
        limiter.configure(OP_EMBED, rate_config.embed_rate, rate_config.embed_burst);

        Self {
            provider,
            limiter,
            cache: ResponseCache::from_config(cache_config),
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerSettings::from(
                breaker_config,
            ))),
            retry: RetryPolicy::default(),
            budget: TickBudget::new(
                llm_config.per_tick_chat_budget,
                llm_config.per_tick_embed_budget,
            ),
            metrics,
            config: llm_config,
        }
    }

    /// Breaker registry, shared with the health checker.
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Reset the per-tick budget. The scheduler calls this atomically at the
    /// top of each slow tick, before any step runs.
    pub fn reset_budget(&self) {
        self.budget.reset();
        let (chat, embed) = self.budget.remaining();
        self.metrics.set_gauge("llm.budget.chat_remaining", f64::from(chat));
        self.metrics
            .set_gauge("llm.budget.embed_remaining", f64::from(embed));
    }

    pub fn budget_remaining(&self) -> (u32, u32) {
        self.budget.remaining()
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    /// One protected chat call.
    pub async fn chat(
        &self,
        prompt: &str,
        system_prompt: &str,
        cancel: &CancelToken,
    ) -> Result<String, LlmError> {
        let key = fingerprint(prompt, system_prompt, None);
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user(prompt),
        ];
        let model = self.config.chat_model.clone();
        self.metrics.incr(&format!("llm.model.{model}.calls"), 1);
        self.protected_call(OP_CHAT, Some(&key), cancel, |timeout| {
            let provider = self.provider.clone();
            let model = model.clone();
            let messages = messages.to_vec();
            async move { provider.chat(&model, &messages, timeout).await }
        })
        .await
    }

    /// One protected embedding call. The vector is returned raw; the vector
    /// store normalizes at insertion.
    pub async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>, LlmError> {
        let key = fingerprint(text, OP_EMBED, None);
        let model = self.config.embed_model.clone();
        self.metrics.incr(&format!("llm.model.{model}.calls"), 1);
        let encoded = self
            .protected_call(OP_EMBED, Some(&key), cancel, |timeout| {
                let provider = self.provider.clone();
                let model = model.clone();
                let text = text.to_string();
                async move {
                    let vector = provider.embed(&model, &text, timeout).await?;
                    serde_json::to_string(&vector)
                        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
                }
            })
            .await?;
        serde_json::from_str(&encoded)
            .map_err(|e| LlmError::Fatal(format!("corrupt cached embedding: {e}")))
    }

    /// Compose the four protected stages around `attempt`.
    async fn protected_call<F, Fut>(
        &self,
        operation: &str,
        cache_key: Option<&str>,
        cancel: &CancelToken,
        mut attempt: F,
    ) -> Result<String, LlmError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: std::future::Future<Output = Result<String, ProviderError>>,
    {
        if !self.budget.try_take(operation) {
            self.count(operation, "budget_exhausted");
            return Err(LlmError::BudgetExhausted {
                operation: operation.to_string(),
            });
        }
        let (chat, embed) = self.budget.remaining();
        self.metrics.set_gauge("llm.budget.chat_remaining", f64::from(chat));
        self.metrics
            .set_gauge("llm.budget.embed_remaining", f64::from(embed));

        let timeout = Duration::from_secs_f64(self.config.timeout_sec);
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                self.count(operation, "cancelled");
                return Err(LlmError::Cancelled);
            }

            // Stage A: rate limiter.
            if !self.limiter.try_acquire(operation) {
                if attempts == 0 {
                    self.budget.refund(operation);
                }
                self.count(operation, "rate_limited");
                return Err(LlmError::RateLimited {
                    operation: operation.to_string(),
                });
            }

            // Stage B: response cache.
            if let Some(key) = cache_key {
                if let Some(hit) = self.cache.get(key) {
                    self.count(operation, "cache_hit");
                    return Ok(hit);
                }
            }

            // Stage C: circuit breaker.
            if let Err(e) = self.breakers.check(LLM_DEPENDENCY).await {
                if attempts == 0 {
                    self.budget.refund(operation);
                }
                self.count(operation, "circuit_open");
                return Err(e);
            }

            // Stages D/E: the attempt itself, under the tick/shutdown token.
            attempts += 1;
            let started = Instant::now();
            let result = tokio::select! {
                result = attempt(timeout) => result,
                _ = cancel.cancelled() => {
                    self.breakers.record_abandoned(LLM_DEPENDENCY).await;
                    self.count(operation, "cancelled");
                    return Err(LlmError::Cancelled);
                }
            };
            self.metrics.observe(
                &format!("llm.{operation}.latency"),
                started.elapsed().as_secs_f64(),
            );
            self.metrics.incr(&format!("llm.{operation}.attempts"), 1);

            match result {
                Ok(response) => {
                    self.breakers.record_success(LLM_DEPENDENCY).await;
                    if let Some(key) = cache_key {
                        self.cache.insert(key, response.clone());
                    }
                    self.count(operation, "ok");
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    self.breakers.record_failure(LLM_DEPENDENCY).await;
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        error = %e,
                        "transient llm failure"
                    );
                    match self.retry.backoff_delay(attempts) {
                        Some(delay) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => {
                                    self.count(operation, "cancelled");
                                    return Err(LlmError::Cancelled);
                                }
                            }
                        }
                        None => {
                            self.count(operation, "transient_failed");
                            return Err(LlmError::TransientFailed {
                                attempts,
                                last_error: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    // A malformed request or response says nothing about the
                    // dependency's availability; release the breaker slot
                    // without counting a failure.
                    self.breakers.record_abandoned(LLM_DEPENDENCY).await;
                    self.count(operation, "fatal");
                    return Err(LlmError::Fatal(e.to_string()));
                }
            }
        }
    }

    fn count(&self, operation: &str, outcome: &str) {
        self.metrics
            .incr(&format!("llm.{operation}.{outcome}"), 1);
        self.metrics.incr("llm.calls.total", 1);
    }
}

#[async_trait]
impl Healthcheck for LlmClient {
    fn name(&self) -> &str {
        "llm"
    }

    async fn health(&self) -> HealthSample {
        let (chat, embed) = self.budget.remaining();
        let states = self.breakers.states().await;
        let open: Vec<&str> = states
            .iter()
            .filter(|(_, (state, _))| *state == "open")
            .map(|(name, _)| name.as_str())
            .collect();
        let sample = if open.is_empty() {
            HealthSample::healthy("llm pipeline nominal")
        } else {
            HealthSample::unhealthy(format!("circuit open for {}", open.join(", ")))
        };
        sample
            .with_detail("budget_chat_remaining", chat.into())
            .with_detail("budget_embed_remaining", embed.into())
            .with_detail(
                "cache",
                serde_json::to_value(self.cache.stats()).unwrap_or_default(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Scriptable provider: fails the first `fail_first` calls with a
    /// transient error, then succeeds.
    struct ScriptedProvider {
        fail_first: u32,
        calls: AtomicU32,
        chat_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                chat_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ProviderError::Connection("refused".to_string()))
            } else {
                Ok(format!("echo: {}", messages.last().unwrap().content))
            }
        }

        async fn embed(
            &self,
            _model: &str,
            input: &str,
            _timeout: Duration,
        ) -> Result<Vec<f32>, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ProviderError::Status { status: 503 })
            } else {
                Ok(vec![input.len() as f32, 1.0, 0.0])
            }
        }

        async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn client_with(provider: Arc<dyn LlmProvider>, config: &Config) -> LlmClient {
        let mut client = LlmClient::new(
            provider,
            config.llm.clone(),
            &config.rate_limit,
            &config.cache,
            &config.circuit_breaker,
            MetricsRegistry::shared(),
        );
        // Fast retries keep the tests quick.
        client.retry = RetryPolicy {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: false,
        };
        client
    }

    fn default_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn chat_success_and_cache_hit() {
        let provider = ScriptedProvider::new(0);
        let client = client_with(provider.clone(), &default_config());
        let cancel = CancelToken::never();

        let first = client.chat("hello", "sys", &cancel).await.unwrap();
        assert_eq!(first, "echo: hello");
        // Same fingerprint: served from cache, provider untouched.
        let second = client.chat("hello", "sys", &cancel).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(provider.chat_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let provider = ScriptedProvider::new(2);
        let client = client_with(provider, &default_config());
        let cancel = CancelToken::never();

        let out = client.chat("retry me", "sys", &cancel).await.unwrap();
        assert_eq!(out, "echo: retry me");
    }

    #[tokio::test]
    async fn transient_failure_after_max_attempts() {
        let provider = ScriptedProvider::new(100);
        let client = client_with(provider, &default_config());
        let cancel = CancelToken::never();

        let err = client.chat("doomed", "sys", &cancel).await.unwrap_err();
        match err {
            LlmError::TransientFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected TransientFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_fails_fast() {
        let mut config = default_config();
        config.llm.per_tick_chat_budget = 2;
        let provider = ScriptedProvider::new(0);
        let client = client_with(provider, &config);
        let cancel = CancelToken::never();

        // Distinct prompts so the cache does not mask budget accounting.
        client.chat("a", "s", &cancel).await.unwrap();
        client.chat("b", "s", &cancel).await.unwrap();
        let err = client.chat("c", "s", &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::BudgetExhausted { .. }));

        client.reset_budget();
        client.chat("d", "s", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_rejection_refunds_budget() {
        let mut config = default_config();
        config.rate_limit.chat_rate = 0.001;
        config.rate_limit.chat_burst = 1;
        config.llm.per_tick_chat_budget = 5;
        let provider = ScriptedProvider::new(0);
        let client = client_with(provider, &config);
        let cancel = CancelToken::never();

        client.chat("only", "s", &cancel).await.unwrap();
        let before = client.budget_remaining().0;
        let err = client.chat("rejected", "s", &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(client.budget_remaining().0, before);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_provider_calls() {
        let mut config = default_config();
        config.circuit_breaker.failure_threshold = 2;
        let provider = ScriptedProvider::new(100);
        let client = client_with(provider.clone(), &config);
        let cancel = CancelToken::never();

        // Each call makes 3 transient attempts; two calls trip the breaker.
        let _ = client.chat("x", "s", &cancel).await;
        let calls_after_trip = provider.chat_calls.load(Ordering::SeqCst);

        let err = client.chat("y", "s", &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen { .. }));
        assert_eq!(provider.chat_calls.load(Ordering::SeqCst), calls_after_trip);
    }

    #[tokio::test]
    async fn embed_returns_vector_and_caches() {
        let provider = ScriptedProvider::new(0);
        let client = client_with(provider, &default_config());
        let cancel = CancelToken::never();

        let v = client.embed("abc", &cancel).await.unwrap();
        assert_eq!(v, vec![3.0, 1.0, 0.0]);
        let again = client.embed("abc", &cancel).await.unwrap();
        assert_eq!(again, v);
    }

    #[tokio::test]
    async fn cancelled_call_returns_promptly() {
        struct HangingProvider;

        #[async_trait]
        impl LlmProvider for HangingProvider {
            async fn chat(
                &self,
                _model: &str,
                _messages: &[ChatMessage],
                _timeout: Duration,
            ) -> Result<String, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("unreachable".to_string())
            }

            async fn embed(
                &self,
                _model: &str,
                _input: &str,
                _timeout: Duration,
            ) -> Result<Vec<f32>, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            }

            async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        let client = client_with(Arc::new(HangingProvider), &default_config());
        let source = crate::shutdown::CancelSource::new();
        let token = source.token();

        let call = tokio::spawn(async move {
            client.chat("hang", "s", &token).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call did not return after cancellation")
            .unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        struct BadRequestProvider {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LlmProvider for BadRequestProvider {
            async fn chat(
                &self,
                _model: &str,
                _messages: &[ChatMessage],
                _timeout: Duration,
            ) -> Result<String, ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Status { status: 400 })
            }

            async fn embed(
                &self,
                _model: &str,
                _input: &str,
                _timeout: Duration,
            ) -> Result<Vec<f32>, ProviderError> {
                Err(ProviderError::InvalidRequest("nope".to_string()))
            }

            async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        let provider = Arc::new(BadRequestProvider {
            calls: AtomicUsize::new(0),
        });
        let client = client_with(provider.clone(), &default_config());
        let cancel = CancelToken::never();

        let err = client.chat("bad", "s", &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::Fatal(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_reports_open_circuit() {
        let mut config = default_config();
        config.circuit_breaker.failure_threshold = 1;
        let client = client_with(ScriptedProvider::new(100), &config);
        let cancel = CancelToken::never();
        let _ = client.chat("x", "s", &cancel).await;

        let sample = client.health().await;
        assert!(!sample.healthy);
        assert!(sample.message.contains("circuit open"));
    }
}
