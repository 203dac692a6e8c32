//! Graceful shutdown: signal capture, cancellation fan-out, and an ordered
//! bounded-time hook drain.
//!
//! A single [`ShutdownCoordinator`] is armed before the scheduler starts.
//! Components receive a [`CancelToken`] and observe it at their suspension
//! points; on SIGINT/SIGTERM the coordinator flips the token, then runs the
//! registered hooks in reverse registration order, each with a bounded
//! timeout, within one total drain budget.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

use crate::types::ShutdownError;

/// Cloneable cancellation handle observed by long-running operations.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires. Useful for tests and standalone tools.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open forever so `cancelled()` pends instead of
        // resolving on sender drop.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling; nothing will ever fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owning side of a cancellation channel.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

type ShutdownHook =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Which signal (or request) stopped the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupt,
    Terminate,
    Requested,
}

impl StopReason {
    /// Conventional process exit code for the reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Interrupt => 130,
            StopReason::Terminate => 143,
            StopReason::Requested => 0,
        }
    }
}

/// Registers hooks and drains them on shutdown.
pub struct ShutdownCoordinator {
    cancel: CancelSource,
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
    total_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(total_timeout: Duration) -> Self {
        Self {
            cancel: CancelSource::new(),
            hooks: Mutex::new(Vec::new()),
            total_timeout,
        }
    }

    /// Token observed by schedulers, receivers and long-running calls.
    pub fn token(&self) -> CancelToken {
        self.cancel.token()
    }

    /// Register a named hook. Hooks run in reverse registration order, so
    /// register producers before consumers.
    pub async fn register<F, Fut>(&self, name: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks
            .lock()
            .await
            .push((name.to_string(), Box::new(move || Box::pin(hook()))));
    }

    /// Request shutdown without a signal (e.g. from a test or an API).
    pub fn request(&self) {
        self.cancel.cancel();
    }

    /// Wait for SIGINT/SIGTERM or an internal request, then flip the
    /// cancellation token. Returns what stopped us.
    pub async fn wait_for_signal(&self) -> StopReason {
        let reason = wait_signal(self.cancel.token()).await;
        self.cancel.cancel();
        reason
    }

    /// Run all hooks in reverse registration order within the total budget.
    ///
    /// Hooks still running when the budget lapses are abandoned and logged;
    /// the process exits anyway.
    pub async fn drain(&self) -> Result<(), ShutdownError> {
        let started = Instant::now();
        let mut hooks = self.hooks.lock().await;
        let total = hooks.len();
        tracing::info!(hooks = total, "draining shutdown hooks");

        let mut remaining: Vec<(String, ShutdownHook)> = hooks.drain(..).collect();
        let mut idx = remaining.len();
        while idx > 0 {
            idx -= 1;
            let (name, hook) = remaining.remove(idx);
            let budget_left = self.total_timeout.saturating_sub(started.elapsed());
            if budget_left.is_zero() {
                tracing::error!(
                    abandoned = idx + 1,
                    "shutdown budget exhausted before all hooks ran"
                );
                return Err(ShutdownError::DrainTimeout {
                    timeout_ms: self.total_timeout.as_millis() as u64,
                    remaining: idx + 1,
                });
            }
            tracing::debug!(hook = %name, "running shutdown hook");
            if tokio::time::timeout(budget_left, hook()).await.is_err() {
                tracing::error!(hook = %name, "shutdown hook timed out");
                return Err(ShutdownError::HookTimeout {
                    hook: name,
                    timeout_ms: budget_left.as_millis() as u64,
                });
            }
        }
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "shutdown drain complete");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_signal(token: CancelToken) -> StopReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => StopReason::Interrupt,
        _ = terminate.recv() => StopReason::Terminate,
        _ = token.cancelled() => StopReason::Requested,
    }
}

#[cfg(not(unix))]
async fn wait_signal(token: CancelToken) -> StopReason {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => StopReason::Interrupt,
        _ = token.cancelled() => StopReason::Requested,
    }
}
