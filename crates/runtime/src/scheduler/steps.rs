//! Built-in core steps: the inbox probe, the inbox responder, and memory
//! maintenance.
//!
//! Cognitive steps (reflection, curiosity, narrative, …) live outside the
//! core and register through the same [`Step`] trait. The fast tick only
//! enqueues inbox-derived work; answering happens on the slow tick, where
//! LLM calls are allowed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::MemoryConfig;
use crate::events::EventBus;
use crate::llm::LlmClient;
use crate::mailbox::Mailbox;
use crate::memory::{EpisodicStore, VectorStore};
use crate::types::{Outcome, Payload};

use super::step::{Step, StepOutcome, TickContext};

/// Event published when a new inbox message arrives.
pub const EVENT_INBOX_MESSAGE: &str = "inbox.message";

/// Work handed from the fast tick to the slow tick: inbox messages waiting
/// for an answer.
#[derive(Default)]
pub struct InboxQueue {
    pending: parking_lot::Mutex<VecDeque<String>>,
}

impl InboxQueue {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, message: String) {
        self.pending.lock().push_back(message);
    }

    pub fn drain(&self) -> Vec<String> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Fast-tick step: probe the inbox file and hand new messages off as an
/// episode, an event, and queued work for the responder.
pub struct InboxStep {
    mailbox: Arc<Mailbox>,
    episodes: Arc<EpisodicStore>,
    bus: Arc<EventBus>,
    queue: Arc<InboxQueue>,
}

impl InboxStep {
    pub fn new(
        mailbox: Arc<Mailbox>,
        episodes: Arc<EpisodicStore>,
        bus: Arc<EventBus>,
        queue: Arc<InboxQueue>,
    ) -> Self {
        Self {
            mailbox,
            episodes,
            bus,
            queue,
        }
    }
}

#[async_trait]
impl Step for InboxStep {
    fn name(&self) -> &str {
        "inbox_probe"
    }

    async fn execute(&self, _ctx: &TickContext) -> StepOutcome {
        let message = match self.mailbox.poll_inbox().await {
            Ok(Some(message)) => message,
            Ok(None) => return StepOutcome::Skipped,
            Err(e) => return StepOutcome::Error(format!("inbox read failed: {e}")),
        };

        let mut data = Payload::new();
        data.insert("text".to_string(), message.clone().into());
        let episode_id = self
            .episodes
            .add_episode("user.message", &message, Outcome::Neutral, Some(data))
            .await;

        self.queue.push(message.clone());
        self.bus
            .publish(
                EVENT_INBOX_MESSAGE,
                serde_json::json!({
                    "text": message,
                    "episode_id": episode_id,
                }),
            )
            .await;
        StepOutcome::Ok
    }
}

/// Slow-tick step: answer queued inbox messages through the protected LLM
/// pipeline. When no answer can be produced, no outgoing message is
/// written and a `social.llm_unavailable` episode records the miss.
pub struct RespondStep {
    queue: Arc<InboxQueue>,
    llm: Arc<LlmClient>,
    mailbox: Arc<Mailbox>,
    episodes: Arc<EpisodicStore>,
    system_prompt: String,
}

impl RespondStep {
    pub fn new(
        queue: Arc<InboxQueue>,
        llm: Arc<LlmClient>,
        mailbox: Arc<Mailbox>,
        episodes: Arc<EpisodicStore>,
        agent_name: &str,
    ) -> Self {
        Self {
            queue,
            llm,
            mailbox,
            episodes,
            system_prompt: format!(
                "You are {agent_name}, an autonomous agent. Reply briefly and helpfully."
            ),
        }
    }
}

#[async_trait]
impl Step for RespondStep {
    fn name(&self) -> &str {
        "inbox_respond"
    }

    async fn execute(&self, ctx: &TickContext) -> StepOutcome {
        if self.queue.is_empty() {
            return StepOutcome::Skipped;
        }
        if ctx.degraded {
            // The LLM (or another critical dependency) is down; keep the
            // messages queued for a healthier tick.
            return StepOutcome::Skipped;
        }

        let mut answered = 0usize;
        let mut missed = 0usize;
        for message in self.queue.drain() {
            if ctx.expired() {
                // Out of time: requeue what we did not get to.
                self.queue.push(message);
                continue;
            }
            match self.llm.chat(&message, &self.system_prompt, &ctx.cancel).await {
                Ok(answer) => {
                    if let Err(e) = self.mailbox.write_outbox(&answer).await {
                        tracing::error!(error = %e, "outbox write failed");
                        missed += 1;
                        continue;
                    }
                    let mut data = Payload::new();
                    data.insert("question".to_string(), message.into());
                    self.episodes
                        .add_episode("social.reply", &answer, Outcome::Success, Some(data))
                        .await;
                    answered += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not answer inbox message");
                    let mut data = Payload::new();
                    data.insert("question".to_string(), message.into());
                    data.insert("reason".to_string(), e.to_string().into());
                    self.episodes
                        .add_episode(
                            "social.llm_unavailable",
                            "inbox message left unanswered",
                            Outcome::Failure,
                            Some(data),
                        )
                        .await;
                    missed += 1;
                }
            }
        }

        tracing::debug!(answered, missed, "inbox responder pass done");
        if missed == 0 {
            StepOutcome::Ok
        } else {
            StepOutcome::Degraded
        }
    }
}

/// Slow-tick step: run episodic archival and vector cleanup once per day.
pub struct MemoryMaintenanceStep {
    episodes: Arc<EpisodicStore>,
    vectors: Arc<VectorStore>,
    config: MemoryConfig,
    interval: Duration,
    last_run: parking_lot::Mutex<Option<Instant>>,
}

impl MemoryMaintenanceStep {
    pub fn new(
        episodes: Arc<EpisodicStore>,
        vectors: Arc<VectorStore>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            episodes,
            vectors,
            config,
            interval: Duration::from_secs(24 * 60 * 60),
            last_run: parking_lot::Mutex::new(None),
        }
    }

    /// Override the maintenance interval (tests).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn due(&self) -> bool {
        let last = self.last_run.lock();
        match *last {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        }
    }
}

#[async_trait]
impl Step for MemoryMaintenanceStep {
    fn name(&self) -> &str {
        "memory_maintenance"
    }

    async fn execute(&self, ctx: &TickContext) -> StepOutcome {
        if !self.due() {
            return StepOutcome::Skipped;
        }
        *self.last_run.lock() = Some(Instant::now());

        let report = match self
            .episodes
            .archive_older_than(self.config.archive_after_days)
            .await
        {
            Ok(report) => report,
            Err(e) => return StepOutcome::Error(format!("archive failed: {e}")),
        };

        if ctx.expired() {
            // Archival committed; cleanup waits for the next due run.
            return StepOutcome::Degraded;
        }

        // Embeddings tied to failure episodes are kept: they carry the most
        // signal for later consolidation.
        let protected = self
            .episodes
            .ids_by_outcome(Outcome::Failure)
            .await
            .unwrap_or_default();
        let deleted = match self
            .vectors
            .cleanup(self.config.vector_cleanup_after_days, &protected)
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => return StepOutcome::Error(format!("vector cleanup failed: {e}")),
        };

        tracing::info!(
            archived = report.archived,
            vector_deleted = deleted,
            "memory maintenance complete"
        );
        StepOutcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::step::Cadence;
    use crate::shutdown::CancelToken;

    fn ctx() -> TickContext {
        TickContext {
            tick: 1,
            cadence: Cadence::Fast,
            deadline: Instant::now() + Duration::from_secs(5),
            degraded: false,
            cancel: CancelToken::never(),
        }
    }

    fn mailbox_in(dir: &tempfile::TempDir) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(
            dir.path().join("inbox.txt"),
            dir.path().join("outbox.txt"),
            "Anima",
        ))
    }

    #[tokio::test]
    async fn inbox_step_skips_when_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
        let step = InboxStep::new(
            mailbox_in(&dir),
            episodes,
            EventBus::shared(),
            InboxQueue::shared(),
        );
        assert_eq!(step.execute(&ctx()).await, StepOutcome::Skipped);
    }

    #[tokio::test]
    async fn inbox_step_records_publishes_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
        let bus = EventBus::shared();
        let queue = InboxQueue::shared();

        let received = Arc::new(parking_lot::Mutex::new(None));
        let sink = received.clone();
        bus.subscribe_fn(EVENT_INBOX_MESSAGE, "sink", move |data| {
            let sink = sink.clone();
            async move {
                *sink.lock() = Some(data["text"].as_str().unwrap().to_string());
                Ok(())
            }
        })
        .await;

        tokio::fs::write(dir.path().join("inbox.txt"), "ping?\n")
            .await
            .unwrap();
        let step = InboxStep::new(mailbox_in(&dir), episodes.clone(), bus, queue.clone());
        assert_eq!(step.execute(&ctx()).await, StepOutcome::Ok);

        assert_eq!(received.lock().as_deref(), Some("ping?"));
        assert_eq!(queue.drain(), vec!["ping?".to_string()]);
        let recent = episodes.recent(1).await.unwrap();
        assert_eq!(recent[0].event_type, "user.message");
        assert_eq!(recent[0].description, "ping?");
    }

    mod respond {
        use super::*;
        use crate::config::Config;
        use crate::llm::{ChatMessage, LlmProvider, ProviderError};
        use crate::metrics::MetricsRegistry;
        use async_trait::async_trait;

        struct FixedProvider {
            fail: bool,
        }

        #[async_trait]
        impl LlmProvider for FixedProvider {
            async fn chat(
                &self,
                _model: &str,
                messages: &[ChatMessage],
                _timeout: Duration,
            ) -> Result<String, ProviderError> {
                if self.fail {
                    // Fatal class: not retried, so the test stays fast.
                    Err(ProviderError::InvalidRequest("no".to_string()))
                } else {
                    Ok(format!("re: {}", messages.last().unwrap().content))
                }
            }

            async fn embed(
                &self,
                _model: &str,
                _input: &str,
                _timeout: Duration,
            ) -> Result<Vec<f32>, ProviderError> {
                Ok(vec![1.0, 0.0])
            }

            async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
                Ok(())
            }
        }

        fn llm(fail: bool) -> Arc<LlmClient> {
            let config = Config::default();
            Arc::new(LlmClient::new(
                Arc::new(FixedProvider { fail }),
                config.llm.clone(),
                &config.rate_limit,
                &config.cache,
                &config.circuit_breaker,
                MetricsRegistry::shared(),
            ))
        }

        #[tokio::test]
        async fn answers_queued_messages_into_outbox() {
            let dir = tempfile::tempdir().unwrap();
            let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
            let queue = InboxQueue::shared();
            queue.push("how are you?".to_string());

            let step = RespondStep::new(
                queue.clone(),
                llm(false),
                mailbox_in(&dir),
                episodes.clone(),
                "Anima",
            );
            assert_eq!(step.execute(&ctx()).await, StepOutcome::Ok);
            assert!(queue.is_empty());

            let outbox = tokio::fs::read_to_string(dir.path().join("outbox.txt"))
                .await
                .unwrap();
            assert!(outbox.contains("re: how are you?"));
            let replies = episodes.by_type("social.reply", 5).await.unwrap();
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].data["question"], "how are you?");
        }

        #[tokio::test]
        async fn failed_answer_writes_unavailable_episode_and_no_outbox() {
            let dir = tempfile::tempdir().unwrap();
            let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
            let queue = InboxQueue::shared();
            queue.push("hello?".to_string());

            let step = RespondStep::new(
                queue.clone(),
                llm(true),
                mailbox_in(&dir),
                episodes.clone(),
                "Anima",
            );
            assert_eq!(step.execute(&ctx()).await, StepOutcome::Degraded);

            assert!(!dir.path().join("outbox.txt").exists());
            let misses = episodes.by_type("social.llm_unavailable", 5).await.unwrap();
            assert_eq!(misses.len(), 1);
            assert_eq!(misses[0].outcome, Outcome::Failure);
        }

        #[tokio::test]
        async fn degraded_tick_keeps_messages_queued() {
            let dir = tempfile::tempdir().unwrap();
            let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
            let queue = InboxQueue::shared();
            queue.push("wait for me".to_string());

            let step = RespondStep::new(
                queue.clone(),
                llm(false),
                mailbox_in(&dir),
                episodes,
                "Anima",
            );
            let degraded = TickContext {
                degraded: true,
                ..ctx()
            };
            assert_eq!(step.execute(&degraded).await, StepOutcome::Skipped);
            assert_eq!(queue.len(), 1);
        }

        #[tokio::test]
        async fn empty_queue_skips() {
            let dir = tempfile::tempdir().unwrap();
            let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
            let step = RespondStep::new(
                InboxQueue::shared(),
                llm(false),
                mailbox_in(&dir),
                episodes,
                "Anima",
            );
            assert_eq!(step.execute(&ctx()).await, StepOutcome::Skipped);
        }
    }

    #[tokio::test]
    async fn maintenance_runs_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
        let vectors = Arc::new(VectorStore::open_in_memory(2).unwrap());
        let step = MemoryMaintenanceStep::new(episodes, vectors, MemoryConfig::default())
            .with_interval(Duration::from_secs(3600));

        assert_eq!(step.execute(&ctx()).await, StepOutcome::Ok);
        // Not due again within the interval.
        assert_eq!(step.execute(&ctx()).await, StepOutcome::Skipped);
    }

    #[tokio::test]
    async fn maintenance_archives_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
        let vectors = Arc::new(VectorStore::open_in_memory(2).unwrap());

        let old = chrono::Utc::now() - chrono::Duration::days(200);
        episodes
            .add_episode_at(old, "thought", "ancient", Outcome::Neutral)
            .await
            .unwrap();
        episodes
            .add_episode("thought", "fresh", Outcome::Neutral, None)
            .await
            .unwrap();
        vectors.add(Some(1), "thought", "stale", &[1.0, 0.0]).await.unwrap();

        let config = MemoryConfig {
            archive_after_days: 90,
            vector_cleanup_after_days: 0,
        };
        let step = MemoryMaintenanceStep::new(episodes.clone(), vectors.clone(), config);
        assert_eq!(step.execute(&ctx()).await, StepOutcome::Ok);

        assert_eq!(episodes.count().await.unwrap(), 1);
        assert_eq!(vectors.count().await.unwrap(), 0);
    }
}
