//! In-process publish/subscribe event bus.
//!
//! Handlers for one `publish` run concurrently with no ordering guarantee
//! among them, and with error isolation: one handler's failure (or panic)
//! never prevents the others from completing, and never escapes `publish`.
//! Failures are counted per handler, recorded in a bounded ring buffer, and
//! and, for events marked critical, appended to a dead-letter queue. Delivery
//! is at-most-once and in-process only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::health::{Healthcheck, HealthSample};

/// Handler failures at or above this count raise a `handler.degraded` alert.
const DEGRADED_THRESHOLD: u64 = 5;
/// Ring buffer capacity for handler error records.
const ERROR_RING_CAPACITY: usize = 100;
/// Dead-letter queue bound; overflow is logged and dropped.
const DEAD_LETTER_CAPACITY: usize = 50;
/// Last-hour failure count above which the bus reports unhealthy.
const UNHEALTHY_HOURLY_FAILURES: usize = 10;

/// Event emitted when a handler crosses the failure threshold.
pub const EVENT_HANDLER_DEGRADED: &str = "handler.degraded";

/// A subscriber to one or more named events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier used in failure accounting.
    fn name(&self) -> &str;

    async fn handle(&self, event: &str, data: &serde_json::Value) -> anyhow::Result<()>;
}

type BoxedHandlerFn = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

struct FnHandler {
    name: String,
    f: BoxedHandlerFn,
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        (self.f)(data.clone()).await
    }
}

/// One recorded handler failure.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub handler: String,
    pub error: String,
    pub data: serde_json::Value,
}

/// Totals and per-handler failure map, consumed by the health checker.
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub events_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub last_hour_failures: usize,
    pub dead_letter_len: usize,
    pub per_handler_failures: HashMap<String, u64>,
}

/// The in-process event bus.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    critical: RwLock<HashSet<String>>,
    failure_counts: DashMap<String, u64>,
    pending_alerts: parking_lot::Mutex<Vec<String>>,
    error_ring: parking_lot::Mutex<VecDeque<HandlerErrorRecord>>,
    dead_letter: parking_lot::Mutex<VecDeque<HandlerErrorRecord>>,
    published: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            critical: RwLock::new(HashSet::new()),
            failure_counts: DashMap::new(),
            pending_alerts: parking_lot::Mutex::new(Vec::new()),
            error_ring: parking_lot::Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            dead_letter: parking_lot::Mutex::new(VecDeque::new()),
            published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe a handler to `event`. Multiple handlers per event are fine.
    pub async fn subscribe(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.subscribers
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Subscribe a named async closure.
    pub async fn subscribe_fn<F, Fut>(&self, event: &str, name: &str, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = FnHandler {
            name: name.to_string(),
            f: Box::new(move |data| Box::pin(f(data))),
        };
        self.subscribe(event, Arc::new(handler)).await;
    }

    /// Mark an event as critical: its handler failures are additionally
    /// captured in the dead-letter queue.
    pub async fn mark_critical(&self, event: &str) {
        self.critical.write().await.insert(event.to_string());
    }

    /// Fan out `data` to all subscribers of `event` concurrently and await
    /// them all. Returns the number of handlers that ran. Never fails.
    pub async fn publish(&self, event: &str, data: serde_json::Value) -> usize {
        let ran = self.dispatch(event, &data).await;

        // Raise degradation alerts outside the dispatch that detected them,
        // so alert handlers cannot recurse into more alerts.
        if event != EVENT_HANDLER_DEGRADED {
            let degraded: Vec<String> = self.pending_alerts.lock().drain(..).collect();
            for handler in degraded {
                let failures = self
                    .failure_counts
                    .get(&handler)
                    .map(|v| *v.value())
                    .unwrap_or(0);
                tracing::warn!(handler = %handler, failures, "event handler degraded");
                let alert = serde_json::json!({
                    "handler": handler,
                    "failures": failures,
                    "event": event,
                });
                self.dispatch(EVENT_HANDLER_DEGRADED, &alert).await;
            }
        }
        ran
    }

    /// The fan-out itself, with no alert logic.
    async fn dispatch(&self, event: &str, data: &serde_json::Value) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscribers.read().await;
            subs.get(event).cloned().unwrap_or_default()
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        if handlers.is_empty() {
            return 0;
        }

        let shared = Arc::new(data.clone());
        let mut joins = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let event = event.to_string();
            let data = shared.clone();
            let name = handler.name().to_string();
            // A spawned task isolates panics as well as errors.
            let join = tokio::spawn(async move { handler.handle(&event, &data).await });
            joins.push(async move { (name, join.await) });
        }

        let ran = joins.len();
        let is_critical = self.critical.read().await.contains(event);
        for (name, result) in futures::future::join_all(joins).await {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_err) if join_err.is_panic() => Some("handler panicked".to_string()),
                Err(join_err) => Some(join_err.to_string()),
            };
            if let Some(error) = error {
                self.record_failure(event, &name, &error, shared.as_ref(), is_critical);
            }
        }
        ran
    }

    fn record_failure(
        &self,
        event: &str,
        handler: &str,
        error: &str,
        data: &serde_json::Value,
        is_critical: bool,
    ) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut entry = self.failure_counts.entry(handler.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count == DEGRADED_THRESHOLD {
            self.pending_alerts.lock().push(handler.to_string());
        }
        tracing::error!(event, handler, error, "event handler failed");

        let record = HandlerErrorRecord {
            timestamp: Utc::now(),
            event: event.to_string(),
            handler: handler.to_string(),
            error: error.to_string(),
            data: data.clone(),
        };

        {
            let mut ring = self.error_ring.lock();
            if ring.len() >= ERROR_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if is_critical {
            let mut dead = self.dead_letter.lock();
            if dead.len() >= DEAD_LETTER_CAPACITY {
                tracing::error!(event, "dead-letter queue full, dropping oldest entry");
                dead.pop_front();
            }
            dead.push_back(record);
        }
    }

    /// Recent handler failures, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<HandlerErrorRecord> {
        let ring = self.error_ring.lock();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Dead-lettered critical failures, oldest first.
    pub fn dead_letters(&self) -> Vec<HandlerErrorRecord> {
        self.dead_letter.lock().iter().cloned().collect()
    }

    pub fn bus_health(&self) -> BusHealth {
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let last_hour_failures = self
            .error_ring
            .lock()
            .iter()
            .filter(|r| r.timestamp >= hour_ago)
            .count();
        BusHealth {
            events_published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            handler_failures: self.failures.load(Ordering::Relaxed),
            last_hour_failures,
            dead_letter_len: self.dead_letter.lock().len(),
            per_handler_failures: self
                .failure_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[async_trait]
impl Healthcheck for EventBus {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn health(&self) -> HealthSample {
        let health = self.bus_health();
        let sample = if health.last_hour_failures < UNHEALTHY_HOURLY_FAILURES {
            HealthSample::healthy(format!(
                "{} events published, {} handler failures",
                health.events_published, health.handler_failures
            ))
        } else {
            HealthSample::unhealthy(format!(
                "{} handler failures in the last hour",
                health.last_hour_failures
            ))
        };
        sample.with_detail(
            "bus",
            serde_json::to_value(&health).unwrap_or_default(),
        )
    }
}
