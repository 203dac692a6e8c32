//! Anima Agent Runtime
//!
//! The core of a long-running autonomous agent: two interleaved tick
//! cadences drive registered steps; steps call the LLM service through a
//! protected pipeline, read and write the episodic and vector memory,
//! publish events in-process, and coordinate with sibling agent processes
//! on this host through a durable message bus, a shared registry, a task
//! coordinator and a consensus engine.

pub mod api;
pub mod config;
pub mod coordination;
pub mod events;
pub mod health;
pub mod llm;
pub mod mailbox;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod shutdown;
pub mod startup;
pub mod types;

// Re-export commonly used types.
pub use config::Config;
pub use coordination::{
    AgentRecord, AgentRegistry, ConsensusEngine, Message, MessageBus, OutgoingMessage,
    RegistryFilter, Task, TaskCoordinator, TaskSpec,
};
pub use events::{EventBus, EventHandler};
pub use health::{AggregateHealth, HealthChecker, HealthSample, Healthcheck};
pub use llm::{HttpLlmProvider, LlmClient, LlmProvider};
pub use mailbox::Mailbox;
pub use memory::{Episode, EpisodicStore, VectorStore};
pub use metrics::MetricsRegistry;
pub use scheduler::{Cadence, Step, StepOutcome, TickContext, TickScheduler};
pub use shutdown::{CancelSource, CancelToken, ShutdownCoordinator, StopReason};
pub use startup::{StartupReport, validate as validate_startup};
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use crate::scheduler::steps::{InboxQueue, InboxStep, MemoryMaintenanceStep, RespondStep};

/// The assembled agent runtime.
///
/// Construction wires every core component together; [`AgentRuntime::run`]
/// drives the schedulers, sweepers and the introspection surface until a
/// signal arrives, then drains through the shutdown coordinator.
pub struct AgentRuntime {
    pub config: Config,
    pub metrics: Arc<MetricsRegistry>,
    pub bus: Arc<EventBus>,
    pub episodes: Arc<EpisodicStore>,
    pub vectors: Arc<VectorStore>,
    pub llm: Arc<LlmClient>,
    pub health: Arc<HealthChecker>,
    pub mailbox: Arc<Mailbox>,
    pub registry: Option<Arc<AgentRegistry>>,
    pub message_bus: Option<Arc<MessageBus>>,
    pub tasks: Option<Arc<TaskCoordinator>>,
    pub consensus: Option<Arc<ConsensusEngine>>,
    shutdown: Arc<ShutdownCoordinator>,
    ticker: TickScheduler,
}

impl AgentRuntime {
    /// Wire all components from configuration. The provider is injected so
    /// tests and embedders can substitute a fake LLM service.
    pub fn new(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self, RuntimeError> {
        let metrics = MetricsRegistry::shared();
        let bus = EventBus::shared();
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs_f64(
            config.shutdown.total_timeout_sec,
        )));

        let episodes = Arc::new(EpisodicStore::open(
            &config.episodic_db_path(),
            &config.archive_dir(),
        )?);
        let vectors = Arc::new(VectorStore::open(
            &config.vector_db_path(),
            config.llm.embedding_dim,
        )?);
        let llm = Arc::new(LlmClient::new(
            provider,
            config.llm.clone(),
            &config.rate_limit,
            &config.cache,
            &config.circuit_breaker,
            metrics.clone(),
        ));
        let mailbox = Arc::new(Mailbox::new(
            config.inbox_path(),
            config.outbox_path(),
            config.agent.name.clone(),
        ));

        let mut health = HealthChecker::new(&config.health);
        health.register(llm.clone());
        health.register(episodes.clone());
        health.register(vectors.clone());
        health.register(bus.clone());
        health.register(llm.breakers());
        let health = Arc::new(health);

        let (registry, message_bus, tasks, consensus) = if config.multi_agent.enabled {
            let registry = Arc::new(AgentRegistry::open(
                &config.registry_path(),
                Duration::from_secs_f64(config.multi_agent.heartbeat_timeout_sec),
            )?);
            let message_bus = Arc::new(MessageBus::open(
                &config.messages_db_path(),
                &config.multi_agent,
            )?);
            let tasks = Arc::new(TaskCoordinator::new(registry.clone()));
            let consensus = Arc::new(ConsensusEngine::open(&config.proposals_db_path())?);
            (Some(registry), Some(message_bus), Some(tasks), Some(consensus))
        } else {
            (None, None, None, None)
        };

        let mut ticker = TickScheduler::new(
            config.ticks.clone(),
            bus.clone(),
            episodes.clone(),
            metrics.clone(),
            shutdown.token(),
        )
        .with_llm(llm.clone())
        .with_health(health.clone());

        // Core steps. Cognitive steps register on top through
        // `register_fast_step` / `register_slow_step`. The fast tick only
        // enqueues inbox work; the responder consumes it on the slow tick.
        let inbox_queue = InboxQueue::shared();
        ticker.register_fast_step(Arc::new(InboxStep::new(
            mailbox.clone(),
            episodes.clone(),
            bus.clone(),
            inbox_queue.clone(),
        )))?;
        ticker.register_slow_step(Arc::new(RespondStep::new(
            inbox_queue,
            llm.clone(),
            mailbox.clone(),
            episodes.clone(),
            &config.agent.name,
        )))?;
        ticker.register_slow_step(Arc::new(MemoryMaintenanceStep::new(
            episodes.clone(),
            vectors.clone(),
            config.memory.clone(),
        )))?;

        Ok(Self {
            config,
            metrics,
            bus,
            episodes,
            vectors,
            llm,
            health,
            mailbox,
            registry,
            message_bus,
            tasks,
            consensus,
            shutdown,
            ticker,
        })
    }

    /// Register an additional lightweight step on the fast cadence.
    pub fn register_fast_step(&mut self, step: Arc<dyn Step>) -> Result<(), RuntimeError> {
        self.ticker.register_fast_step(step)?;
        Ok(())
    }

    /// Register an additional heavyweight step on the slow cadence.
    pub fn register_slow_step(&mut self, step: Arc<dyn Step>) -> Result<(), RuntimeError> {
        self.ticker.register_slow_step(step)?;
        Ok(())
    }

    /// Cancellation token shared by every long-running operation.
    pub fn cancel_token(&self) -> CancelToken {
        self.shutdown.token()
    }

    /// Request shutdown from inside the process (tests, API, steps).
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// Handle that can request shutdown after [`AgentRuntime::run`] has
    /// consumed the runtime.
    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    /// Run until a signal (or an internal request) stops the agent, then
    /// drain shutdown hooks within the configured budget.
    pub async fn run(self) -> Result<StopReason, RuntimeError> {
        let token = self.shutdown.token();

        // Announce ourselves to the registry before anything consumes work.
        if let Some(registry) = &self.registry {
            registry
                .register(
                    AgentRecord::new(
                        AgentId::new(self.config.agent.id.clone()),
                        self.config.agent.name.clone(),
                        AgentRole::Generalist,
                    ),
                )
                .await?;
        }

        let mut workers = Vec::new();
        if let Some(registry) = &self.registry {
            workers.push(tokio::spawn(registry.clone().run_sweeper(token.clone())));
        }
        if let Some(message_bus) = &self.message_bus {
            workers.push(tokio::spawn(message_bus.clone().run_sweeper(token.clone())));
        }
        if self.config.api.enabled {
            let state = Arc::new(api::ApiState {
                agent_name: self.config.agent.name.clone(),
                metrics: self.metrics.clone(),
                health: self.health.clone(),
                episodes: self.episodes.clone(),
                registry: self.registry.clone(),
                message_bus: self.message_bus.clone(),
            });
            let addr: std::net::SocketAddr =
                format!("{}:{}", self.config.api.host, self.config.api.port)
                    .parse()
                    .map_err(|e| RuntimeError::Internal(format!("bad api address: {e}")))?;
            let api_token = token.clone();
            workers.push(tokio::spawn(async move {
                if let Err(e) = api::serve(addr, state, api_token).await {
                    tracing::error!(error = %e, "introspection api failed");
                }
            }));
        }

        // Periodic metrics snapshots to disk.
        {
            let exporter = metrics::file::FileExporter::new(
                self.config.logs_dir().join("metrics.json"),
                true,
            )
            .map_err(|e| RuntimeError::Internal(format!("metrics exporter: {e}")))?;
            let registry = self.metrics.clone();
            let export_token = token.clone();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = export_token.cancelled() => break,
                    }
                    if export_token.is_cancelled() {
                        break;
                    }
                    if let Err(e) = exporter.export(&registry.snapshot()).await {
                        tracing::warn!(error = %e, "metrics export failed");
                    }
                }
            }));
        }

        // Final shutdown hooks, run in reverse order: flush metrics last.
        {
            let registry = self.metrics.clone();
            let path = self.config.logs_dir().join("metrics.json");
            self.shutdown
                .register("metrics-final-snapshot", move || async move {
                    if let Ok(exporter) = metrics::file::FileExporter::new(path, true) {
                        let _ = exporter.export(&registry.snapshot()).await;
                    }
                })
                .await;
        }
        if let Some(registry) = self.registry.clone() {
            let agent_id = AgentId::new(self.config.agent.id.clone());
            self.shutdown
                .register("registry-unregister", move || async move {
                    let _ = registry.unregister(&agent_id).await;
                })
                .await;
        }

        self.episodes
            .add_episode(
                "agent.started",
                &format!("{} is awake", self.config.agent.name),
                Outcome::Success,
                None,
            )
            .await;

        // Drive the scheduler and wait for a stop signal.
        let ticker = Arc::new(self.ticker);
        let scheduler_task = {
            let ticker = ticker.clone();
            tokio::spawn(async move { ticker.run().await })
        };

        let reason = self.shutdown.wait_for_signal().await;
        tracing::info!(?reason, "shutdown requested, draining");

        // The token is flipped; the scheduler finishes its grace window.
        let grace = Duration::from_secs_f64(self.config.ticks.heavy_tick_grace_sec);
        if tokio::time::timeout(grace, scheduler_task).await.is_err() {
            tracing::warn!("scheduler did not stop within grace, abandoning");
        }

        if let Err(e) = self.shutdown.drain().await {
            tracing::error!(error = %e, "shutdown drain incomplete");
        }
        for worker in workers {
            worker.abort();
        }

        self.episodes
            .add_episode(
                "agent.stopped",
                &format!("{} is going to sleep", self.config.agent.name),
                Outcome::Success,
                None,
            )
            .await;

        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::llm::{ChatMessage, ProviderError};

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn chat(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            Ok(messages.last().map(|m| m.content.clone()).unwrap_or_default())
        }

        async fn embed(
            &self,
            _model: &str,
            _input: &str,
            _timeout: Duration,
        ) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }

        async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.api.enabled = false;
        config.llm.embedding_dim = 4;
        config.ticks.fast_tick_sec = 0.02;
        config.ticks.heavy_tick_sec = 0.05;
        config.ticks.heavy_tick_grace_sec = 1.0;
        config
    }

    #[tokio::test]
    async fn runtime_wires_components() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::new(test_config(&dir), Arc::new(EchoProvider)).unwrap();
        assert!(runtime.registry.is_some());
        assert!(runtime.message_bus.is_some());
        assert_eq!(runtime.llm.embedding_dim(), 4);

        let aggregate = runtime.health.check_all(true).await;
        assert!(aggregate.healthy, "{}", aggregate.summary);
        assert_eq!(aggregate.components.len(), 5);
    }

    #[tokio::test]
    async fn multi_agent_disabled_drops_fabric() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.multi_agent.enabled = false;
        let runtime = AgentRuntime::new(config, Arc::new(EchoProvider)).unwrap();
        assert!(runtime.registry.is_none());
        assert!(runtime.message_bus.is_none());
        assert!(runtime.tasks.is_none());
        assert!(runtime.consensus.is_none());
    }

    #[tokio::test]
    async fn runtime_runs_and_stops_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::new(test_config(&dir), Arc::new(EchoProvider)).unwrap();
        let episodes = runtime.episodes.clone();
        let handle = runtime.cancel_token();
        let shutdown = runtime.shutdown.clone();

        let run = tokio::spawn(runtime.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.request();

        let reason = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("runtime did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Requested);
        assert!(handle.is_cancelled());

        // Lifecycle episodes were written and ticks ran.
        let types: Vec<String> = episodes
            .recent(50)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&"agent.started".to_string()));
        assert!(types.contains(&"agent.stopped".to_string()));
    }
}
