//! The tick scheduler: two interleaved cadences driving registered steps.
//!
//! The fast loop (default 1 s) runs lightweight steps; the slow loop
//! (default 60 s) resets the LLM budget, consults the health aggregate, and
//! runs the heavyweight steps in registration order. Every step runs inside
//! a uniform error boundary: failures and panics are caught, logged,
//! recorded as an `outcome=error` episode, and the tick proceeds to the
//! next step. After the last step each tick publishes `tick.completed`.
//!
//! An overrunning tick delays (never drops) the next one; a step that blows
//! through its deadline is hard-stopped after the configured grace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;

use crate::config::TicksConfig;
use crate::events::EventBus;
use crate::health::HealthChecker;
use crate::llm::LlmClient;
use crate::memory::EpisodicStore;
use crate::metrics::MetricsRegistry;
use crate::shutdown::CancelToken;
use crate::types::{Outcome, Payload, SchedulerError};

pub mod step;
pub mod steps;

pub use step::{Cadence, Step, StepOutcome, TickContext};

/// Consecutive step errors at which an alarm event is published.
const STEP_ALARM_THRESHOLD: u32 = 5;

/// Event published after every tick with duration and per-step outcomes.
pub const EVENT_TICK_COMPLETED: &str = "tick.completed";
/// Event published when a step keeps failing.
pub const EVENT_STEP_ALARM: &str = "scheduler.step_alarm";
/// Event published when a slow tick starts with a critical component down,
/// so the proactive layer can notify the user.
pub const EVENT_HEALTH_DEGRADED: &str = "health.degraded";

/// The two-cadence cooperative scheduler.
pub struct TickScheduler {
    config: TicksConfig,
    fast_steps: Vec<Arc<dyn Step>>,
    slow_steps: Vec<Arc<dyn Step>>,
    llm: Option<Arc<LlmClient>>,
    health: Option<Arc<HealthChecker>>,
    bus: Arc<EventBus>,
    episodes: Arc<EpisodicStore>,
    metrics: Arc<MetricsRegistry>,
    cancel: CancelToken,
    error_streaks: parking_lot::Mutex<HashMap<String, u32>>,
}

impl TickScheduler {
    pub fn new(
        config: TicksConfig,
        bus: Arc<EventBus>,
        episodes: Arc<EpisodicStore>,
        metrics: Arc<MetricsRegistry>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            fast_steps: Vec::new(),
            slow_steps: Vec::new(),
            llm: None,
            health: None,
            bus,
            episodes,
            metrics,
            cancel,
            error_streaks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Attach the LLM client whose per-tick budget resets at each slow tick.
    pub fn with_llm(mut self, llm: Arc<LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Attach the health checker consulted before each slow tick.
    pub fn with_health(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    /// Register a lightweight step on the fast cadence.
    pub fn register_fast_step(&mut self, step: Arc<dyn Step>) -> Result<(), SchedulerError> {
        Self::register(&mut self.fast_steps, step)
    }

    /// Register a heavyweight step on the slow cadence. Order matters:
    /// steps run in registration order and later steps consume state
    /// written by earlier ones.
    pub fn register_slow_step(&mut self, step: Arc<dyn Step>) -> Result<(), SchedulerError> {
        Self::register(&mut self.slow_steps, step)
    }

    fn register(
        steps: &mut Vec<Arc<dyn Step>>,
        step: Arc<dyn Step>,
    ) -> Result<(), SchedulerError> {
        if steps.iter().any(|s| s.name() == step.name()) {
            return Err(SchedulerError::DuplicateStep(step.name().to_string()));
        }
        steps.push(step);
        Ok(())
    }

    /// Current consecutive-error streak for a step.
    pub fn consecutive_errors(&self, step: &str) -> u32 {
        self.error_streaks.lock().get(step).copied().unwrap_or(0)
    }

    /// Drive both cadences until shutdown is requested.
    pub async fn run(&self) {
        tracing::info!(
            fast_steps = self.fast_steps.len(),
            slow_steps = self.slow_steps.len(),
            fast_period = self.config.fast_tick_sec,
            slow_period = self.config.heavy_tick_sec,
            "tick scheduler starting"
        );
        tokio::join!(self.cadence_loop(Cadence::Fast), self.cadence_loop(Cadence::Slow));
        tracing::info!("tick scheduler stopped");
    }

    async fn cadence_loop(&self, cadence: Cadence) {
        let period = match cadence {
            Cadence::Fast => Duration::from_secs_f64(self.config.fast_tick_sec),
            Cadence::Slow => Duration::from_secs_f64(self.config.heavy_tick_sec),
        };
        let steps = match cadence {
            Cadence::Fast => &self.fast_steps,
            Cadence::Slow => &self.slow_steps,
        };
        if steps.is_empty() {
            return;
        }

        let mut interval = tokio::time::interval(period);
        // An overrunning tick delays the next one instead of bursting.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            if self.cancel.is_cancelled() {
                break;
            }
            tick += 1;
            self.run_tick(cadence, tick, period, steps).await;
        }
    }

    /// One tick: budget reset, health snapshot, steps in order, completion
    /// event.
    pub async fn run_tick(
        &self,
        cadence: Cadence,
        tick: u64,
        period: Duration,
        steps: &[Arc<dyn Step>],
    ) {
        let started = Instant::now();
        let mut degraded = false;

        if cadence == Cadence::Slow {
            // Budget reset is atomic at the top of the tick, before any step.
            if let Some(llm) = &self.llm {
                llm.reset_budget();
            }
            if let Some(health) = &self.health {
                let aggregate = health.check_all(false).await;
                degraded = aggregate.degraded;
                if degraded {
                    tracing::warn!(tick, "critical component unhealthy, tick degraded");
                    self.bus
                        .publish(
                            EVENT_HEALTH_DEGRADED,
                            serde_json::json!({
                                "tick": tick,
                                "issues": aggregate.issues,
                            }),
                        )
                        .await;
                }
            }
        }

        let deadline = started + period;
        let mut outcomes: Vec<(String, StepOutcome)> = Vec::with_capacity(steps.len());
        for step in steps {
            if self.cancel.is_cancelled() {
                tracing::info!(tick, cadence = cadence.label(), "cancelled mid-tick");
                break;
            }
            let ctx = TickContext {
                tick,
                cadence,
                deadline,
                degraded,
                cancel: self.cancel.clone(),
            };
            let outcome = self.run_step(step.clone(), ctx).await;
            outcomes.push((step.name().to_string(), outcome));
        }

        let duration = started.elapsed();
        self.metrics
            .incr(&format!("scheduler.{}_ticks", cadence.label()), 1);
        self.metrics.observe(
            &format!("scheduler.{}_tick.duration", cadence.label()),
            duration.as_secs_f64(),
        );

        let outcome_map: serde_json::Map<String, serde_json::Value> = outcomes
            .iter()
            .map(|(name, outcome)| {
                (name.clone(), serde_json::Value::from(outcome.label()))
            })
            .collect();
        self.bus
            .publish(
                EVENT_TICK_COMPLETED,
                serde_json::json!({
                    "cadence": cadence.label(),
                    "tick": tick,
                    "duration_ms": duration.as_millis() as u64,
                    "degraded": degraded,
                    "steps": outcome_map,
                }),
            )
            .await;
    }

    /// The uniform step error boundary.
    async fn run_step(&self, step: Arc<dyn Step>, ctx: TickContext) -> StepOutcome {
        let name = step.name().to_string();
        let tick = ctx.tick;
        let cadence = ctx.cadence;
        let grace = match cadence {
            Cadence::Slow => Duration::from_secs_f64(self.config.heavy_tick_grace_sec),
            Cadence::Fast => Duration::from_secs_f64(self.config.fast_tick_sec),
        };
        // Hard stop: cooperative steps return at `deadline`; this bound only
        // fires for steps that ignore it.
        let hard_stop = (ctx.deadline + grace).saturating_duration_since(Instant::now());

        let mut run = {
            let step = step.clone();
            tokio::spawn(async move { step.execute(&ctx).await })
        };
        let outcome = match tokio::time::timeout(hard_stop, &mut run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                StepOutcome::Error("step panicked".to_string())
            }
            Ok(Err(join_err)) => StepOutcome::Error(join_err.to_string()),
            Err(_) => {
                run.abort();
                StepOutcome::Error(format!("exceeded deadline plus {grace:?} grace"))
            }
        };

        self.metrics.incr(
            &format!("scheduler.step.{name}.{}", outcome.label()),
            1,
        );

        if let StepOutcome::Error(reason) = &outcome {
            tracing::error!(step = %name, tick, reason = %reason, "step failed");
            let mut data = Payload::new();
            data.insert("step".to_string(), name.clone().into());
            data.insert("tick".to_string(), tick.into());
            data.insert("cadence".to_string(), cadence.label().into());
            self.episodes
                .add_episode(
                    "scheduler.step_error",
                    &format!("step {name} failed on tick {tick}: {reason}"),
                    Outcome::Error,
                    Some(data),
                )
                .await;

            let streak = {
                let mut streaks = self.error_streaks.lock();
                let streak = streaks.entry(name.clone()).or_insert(0);
                *streak += 1;
                *streak
            };
            if streak == STEP_ALARM_THRESHOLD {
                tracing::error!(step = %name, streak, "step alarm raised");
                self.bus
                    .publish(
                        EVENT_STEP_ALARM,
                        serde_json::json!({
                            "step": name,
                            "consecutive_errors": streak,
                        }),
                    )
                    .await;
            }
        } else {
            self.error_streaks.lock().remove(&name);
        }

        outcome
    }
}
