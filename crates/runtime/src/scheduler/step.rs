//! The step contract: the unit of work the tick scheduler drives.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::shutdown::CancelToken;

/// Which loop a tick belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Light work every second: sensor polls, timer checks, inbox probe.
    Fast,
    /// Heavy work every minute: LLM calls, consolidation, reflection.
    Slow,
}

impl Cadence {
    pub fn label(&self) -> &'static str {
        match self {
            Cadence::Fast => "fast",
            Cadence::Slow => "slow",
        }
    }
}

/// Outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    /// Nothing to do this tick (e.g. not due yet).
    Skipped,
    /// Ran partially or fell back because a dependency is unhealthy or the
    /// deadline was reached.
    Degraded,
    Error(String),
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Degraded => "degraded",
            StepOutcome::Error(_) => "error",
        }
    }
}

/// Per-tick context handed to each step.
///
/// Steps are cooperative: they check `deadline` (or `cancelled`) at internal
/// loop boundaries and must not block without a bounded timeout.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub tick: u64,
    pub cadence: Cadence,
    pub deadline: Instant,
    /// True when a critical component was unhealthy at tick start; steps
    /// depending on it should skip or fall back.
    pub degraded: bool,
    pub cancel: CancelToken,
}

impl TickContext {
    /// Time left before the step should wind down.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once the deadline passed or shutdown was requested.
    pub fn expired(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining().is_zero()
    }
}

/// A named unit of work registered with the scheduler.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in logs, episodes and alarm events.
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &TickContext) -> StepOutcome;
}
