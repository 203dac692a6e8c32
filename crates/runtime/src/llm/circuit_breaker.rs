//! Per-dependency circuit breaker.
//!
//! Prevents cascade failures by tracking dependency health and fast-failing
//! while a circuit is open. Implements the standard
//! Closed → Open → Half-Open state machine; in half-open at most one probe
//! call is in flight at a time, and `success_threshold` consecutive probe
//! successes restore Closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::CircuitBreakerConfig;
use crate::health::{HealthSample, Healthcheck};
use crate::types::LlmError;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Calls flow through.
    Closed,
    /// Failures exceeded threshold. Calls are immediately rejected.
    Open {
        /// When the circuit was opened.
        opened_at: Instant,
    },
    /// Recovery testing. Probe calls are let through one at a time.
    HalfOpen,
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Thresholds resolved from [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(c: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            recovery_timeout: Duration::from_secs_f64(c.recovery_timeout_sec),
            success_threshold: c.success_threshold,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Counters exposed for introspection and health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub fast_fails: u64,
}

/// A circuit breaker for a single named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probe_in_flight: bool,
    last_transition: Instant,
    stats: BreakerStats,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the Closed state.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            probe_in_flight: false,
            last_transition: Instant::now(),
            stats: BreakerStats::default(),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// Returns the remaining recovery time when the circuit rejects the call.
    pub fn check(&mut self, dependency: &str) -> Result<(), LlmError> {
        self.stats.total_calls += 1;
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.recovery_timeout {
                    self.transition(CircuitState::HalfOpen);
                    self.probe_in_flight = true;
                    self.consecutive_successes = 0;
                    tracing::info!(dependency, "circuit breaker probing, now half-open");
                    Ok(())
                } else {
                    self.stats.fast_fails += 1;
                    let remaining = self.settings.recovery_timeout - opened_at.elapsed();
                    Err(LlmError::CircuitOpen {
                        dependency: dependency.to_string(),
                        recovery_remaining_ms: remaining.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    self.stats.fast_fails += 1;
                    Err(LlmError::CircuitOpen {
                        dependency: dependency.to_string(),
                        recovery_remaining_ms: 0,
                    })
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, dependency: &str) {
        self.stats.successes += 1;
        self.probe_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.settings.success_threshold {
                    self.transition(CircuitState::Closed);
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    tracing::info!(dependency, "circuit breaker recovered, now closed");
                }
            }
            CircuitState::Open { .. } => {
                // A success while open means the caller raced a transition;
                // treat it as recovery evidence.
                self.transition(CircuitState::Closed);
                self.consecutive_failures = 0;
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, dependency: &str) {
        self.stats.failures += 1;
        self.probe_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(CircuitState::Open {
                        opened_at: Instant::now(),
                    });
                    tracing::warn!(
                        dependency,
                        failures = self.consecutive_failures,
                        "circuit breaker tripped open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = 0;
                self.transition(CircuitState::Open {
                    opened_at: Instant::now(),
                });
                tracing::warn!(dependency, "circuit breaker probe failed, back to open");
            }
            CircuitState::Open { .. } => {
                self.consecutive_failures += 1;
            }
        }
    }

    /// Release an admitted call without counting an outcome. Used when a
    /// call is cancelled or fails for reasons that say nothing about the
    /// dependency (e.g. a malformed request).
    pub fn record_abandoned(&mut self) {
        self.probe_in_flight = false;
    }

    fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.last_transition = Instant::now();
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn stats(&self) -> &BreakerStats {
        &self.stats
    }
}

/// Registry of circuit breakers for all named dependencies.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_settings: BreakerSettings,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_settings: BreakerSettings) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_settings,
        }
    }

    /// Check if a call to `dependency` may proceed.
    pub async fn check(&self, dependency: &str) -> Result<(), LlmError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_settings.clone()));
        breaker.check(dependency)
    }

    pub async fn record_success(&self, dependency: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(dependency) {
            breaker.record_success(dependency);
        }
    }

    pub async fn record_failure(&self, dependency: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_settings.clone()));
        breaker.record_failure(dependency);
    }

    /// Release an admitted call without recording an outcome.
    pub async fn record_abandoned(&self, dependency: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(dependency) {
            breaker.record_abandoned();
        }
    }

    /// State label of a specific breaker, if it exists.
    pub async fn state_of(&self, dependency: &str) -> Option<&'static str> {
        let breakers = self.breakers.read().await;
        breakers.get(dependency).map(|b| b.state().label())
    }

    /// (state label, stats) per dependency, for introspection and health.
    pub async fn states(&self) -> HashMap<String, (&'static str, BreakerStats)> {
        let breakers = self.breakers.read().await;
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), (b.state().label(), b.stats().clone())))
            .collect()
    }

    /// True when no breaker is currently open.
    pub async fn all_closed(&self) -> bool {
        let breakers = self.breakers.read().await;
        breakers
            .values()
            .all(|b| !matches!(b.state(), CircuitState::Open { .. }))
    }
}

#[async_trait]
impl Healthcheck for CircuitBreakerRegistry {
    fn name(&self) -> &str {
        "circuit_breakers"
    }

    async fn health(&self) -> HealthSample {
        let states = self.states().await;
        let open: Vec<&str> = states
            .iter()
            .filter(|(_, (state, _))| *state == "open")
            .map(|(name, _)| name.as_str())
            .collect();
        let sample = if open.is_empty() {
            HealthSample::healthy(format!("{} breakers, all conducting", states.len()))
        } else {
            HealthSample::unhealthy(format!("open circuits: {}", open.join(", ")))
        };
        sample.with_detail(
            "breakers",
            serde_json::to_value(
                states
                    .iter()
                    .map(|(name, (state, _))| (name.clone(), *state))
                    .collect::<std::collections::HashMap<_, _>>(),
            )
            .unwrap_or_default(),
        )
    }
}
