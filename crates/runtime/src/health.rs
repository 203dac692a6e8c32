//! Component health aggregation.
//!
//! Each core component implements [`Healthcheck`]; the [`HealthChecker`]
//! samples them all with a short per-component deadline and caches the
//! aggregate for a few seconds. The tick scheduler consults the aggregate
//! before each slow tick and degrades steps that depend on unhealthy
//! critical components.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::HealthConfig;
use crate::types::Payload;

/// One component's self-reported health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub healthy: bool,
    pub message: String,
    pub details: Payload,
}

impl HealthSample {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
            details: Payload::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            details: Payload::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Implemented by every component included in the aggregate.
#[async_trait]
pub trait Healthcheck: Send + Sync {
    /// Stable component name used in config `critical_components`.
    fn name(&self) -> &str;

    async fn health(&self) -> HealthSample;
}

/// Aggregate over all registered components.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealth {
    pub healthy: bool,
    pub components: HashMap<String, HealthSample>,
    pub issues: Vec<String>,
    pub summary: String,
    /// True when a critical component is unhealthy; degrades the slow tick.
    pub degraded: bool,
}

/// Samples registered components with caching.
pub struct HealthChecker {
    components: Vec<Arc<dyn Healthcheck>>,
    critical: HashSet<String>,
    cache_ttl: Duration,
    check_timeout: Duration,
    cached: Mutex<Option<(Instant, AggregateHealth)>>,
}

impl HealthChecker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            components: Vec::new(),
            critical: config.critical_components.iter().cloned().collect(),
            cache_ttl: Duration::from_secs_f64(config.cache_ttl_sec),
            check_timeout: Duration::from_secs(2),
            cached: Mutex::new(None),
        }
    }

    /// Register a component. Call during startup, before the schedulers run.
    pub fn register(&mut self, component: Arc<dyn Healthcheck>) {
        self.components.push(component);
    }

    /// Run all checks, or return the cached aggregate if it is fresh and
    /// `force` is not set.
    pub async fn check_all(&self, force: bool) -> AggregateHealth {
        {
            let cached = self.cached.lock().await;
            if !force {
                if let Some((at, aggregate)) = cached.as_ref() {
                    if at.elapsed() <= self.cache_ttl {
                        return aggregate.clone();
                    }
                }
            }
        }

        let mut components = HashMap::new();
        let mut issues = Vec::new();
        for component in &self.components {
            let name = component.name().to_string();
            let sample = match tokio::time::timeout(self.check_timeout, component.health()).await
            {
                Ok(sample) => sample,
                Err(_) => HealthSample::unhealthy(format!(
                    "health check timed out after {:?}",
                    self.check_timeout
                )),
            };
            if !sample.healthy {
                issues.push(format!("{name}: {}", sample.message));
            }
            components.insert(name, sample);
        }

        let healthy = issues.is_empty();
        let degraded = components
            .iter()
            .any(|(name, sample)| !sample.healthy && self.critical.contains(name));
        let summary = if healthy {
            format!("all {} components healthy", components.len())
        } else {
            format!("{} of {} components unhealthy", issues.len(), components.len())
        };
        let aggregate = AggregateHealth {
            healthy,
            components,
            issues,
            summary,
            degraded,
        };

        *self.cached.lock().await = Some((Instant::now(), aggregate.clone()));
        aggregate
    }
}
