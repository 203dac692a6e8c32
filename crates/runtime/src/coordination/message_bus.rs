//! Durable multi-agent message bus backed by SQLite.
//!
//! Agent processes on the same host coordinate through one WAL database.
//! Messages are claimed atomically (a single `UPDATE … RETURNING` moves
//! pending rows to in-flight), so a message reaches at most one receiver.
//! In-flight messages that outlive the visibility timeout return to pending
//! with a retry increment; repeated failures and expired messages land in
//! the dead-letter table. Topic sends fan out one copy per subscriber at
//! send time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::Notify;

use crate::config::MultiAgentConfig;
use crate::shutdown::CancelToken;
use crate::types::{
    AgentId, CoordinationError, MessageId, MessagePriority, MessageStatus, MessageType, Payload,
};

/// Prefix marking a topic-style recipient.
pub const TOPIC_PREFIX: &str = "@topic:";

/// Sortable timestamp format shared by all bus columns.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Inner SQLite busy timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ts() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

fn ts_in(duration: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(60)))
        .format(TS_FORMAT)
        .to_string()
}

fn ts_ago(duration: Duration) -> String {
    (Utc::now() - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(60)))
        .format(TS_FORMAT)
        .to_string()
}

/// One bus message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Message {
    pub id: MessageId,
    pub from_agent: AgentId,
    pub to_agent: String,
    pub msg_type: MessageType,
    pub priority: MessagePriority,
    pub payload: Payload,
    pub status: MessageStatus,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub retries: u32,
    pub expires_at: Option<String>,
}

/// Outgoing message before it gets an id and a status.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub from_agent: AgentId,
    pub to_agent: String,
    pub msg_type: MessageType,
    pub priority: MessagePriority,
    pub payload: Payload,
    pub ttl: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(from: AgentId, to: impl Into<String>, msg_type: MessageType) -> Self {
        Self {
            from_agent: from,
            to_agent: to.into(),
            msg_type,
            priority: MessagePriority::Normal,
            payload: Payload::new(),
            ttl: None,
        }
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of one background sweep.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepReport {
    /// Stale in-flight messages returned to pending.
    pub requeued: usize,
    /// Messages terminally failed for exceeding max retries.
    pub failed: usize,
    /// Pending messages expired by TTL.
    pub expired: usize,
}

/// Queue depths by status, for introspection.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub acked: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub by_priority: std::collections::HashMap<String, i64>,
}

/// The durable message bus.
pub struct MessageBus {
    conn: tokio::sync::Mutex<Connection>,
    visibility_timeout: Duration,
    max_retries: u32,
    poll_interval: Duration,
    /// Wakes blocking receivers when a message arrives for them.
    notifiers: DashMap<String, Arc<Notify>>,
}

impl MessageBus {
    pub fn open(path: &Path, config: &MultiAgentConfig) -> Result<Self, CoordinationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoordinationError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_connection(&conn)?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn open_in_memory(config: &MultiAgentConfig) -> Result<Self, CoordinationError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: &MultiAgentConfig) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(conn),
            visibility_timeout: Duration::from_secs_f64(config.visibility_timeout_sec),
            max_retries: config.max_retries,
            poll_interval: Duration::from_secs_f64(config.poll_interval_sec),
            notifiers: DashMap::new(),
        }
    }

    fn init_connection(conn: &Connection) -> Result<(), CoordinationError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id           TEXT PRIMARY KEY,
                from_agent   TEXT NOT NULL,
                to_agent     TEXT NOT NULL,
                msg_type     TEXT NOT NULL,
                priority     INTEGER NOT NULL DEFAULT 1,
                payload      TEXT NOT NULL DEFAULT '{}',
                status       TEXT NOT NULL DEFAULT 'pending',
                created_at   TEXT NOT NULL,
                processed_at TEXT,
                retries      INTEGER NOT NULL DEFAULT 0,
                expires_at   TEXT
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                topic    TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                PRIMARY KEY (topic, agent_id)
            );

            CREATE TABLE IF NOT EXISTS dead_letter (
                id         INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL,
                reason     TEXT NOT NULL,
                failed_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(to_agent, status);
            CREATE INDEX IF NOT EXISTS idx_messages_claim
                ON messages(status, priority DESC, created_at);",
        )?;
        Ok(())
    }

    fn notifier(&self, agent: &str) -> Arc<Notify> {
        self.notifiers
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Subscribe an agent to a topic.
    pub async fn subscribe_topic(
        &self,
        agent: &AgentId,
        topic: &str,
    ) -> Result<(), CoordinationError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (topic, agent_id) VALUES (?1, ?2)",
            rusqlite::params![topic, agent.as_str()],
        )?;
        Ok(())
    }

    pub async fn unsubscribe_topic(
        &self,
        agent: &AgentId,
        topic: &str,
    ) -> Result<(), CoordinationError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM subscriptions WHERE topic = ?1 AND agent_id = ?2",
            rusqlite::params![topic, agent.as_str()],
        )?;
        Ok(())
    }

    /// Send a message. A `@topic:<name>` recipient fans out one copy per
    /// subscriber; the returned ids are the copies actually inserted.
    pub async fn send(&self, message: OutgoingMessage) -> Result<Vec<MessageId>, CoordinationError> {
        let payload = serde_json::to_string(&message.payload)?;
        let created_at = now_ts();
        let expires_at = message.ttl.map(ts_in);

        let recipients: Vec<String> = if let Some(topic) =
            message.to_agent.strip_prefix(TOPIC_PREFIX)
        {
            let conn = self.conn.lock().await;
            let mut stmt =
                conn.prepare("SELECT agent_id FROM subscriptions WHERE topic = ?1 ORDER BY agent_id")?;
            let rows = stmt.query_map(rusqlite::params![topic], |row| row.get::<_, String>(0))?;
            let mut recipients = Vec::new();
            for row in rows {
                recipients.push(row?);
            }
            recipients
        } else {
            vec![message.to_agent.clone()]
        };

        let mut ids = Vec::with_capacity(recipients.len());
        {
            let conn = self.conn.lock().await;
            for recipient in &recipients {
                let id = MessageId::new();
                conn.execute(
                    "INSERT INTO messages
                        (id, from_agent, to_agent, msg_type, priority, payload,
                         status, created_at, processed_at, retries, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, NULL, 0, ?8)",
                    rusqlite::params![
                        id.to_string(),
                        message.from_agent.as_str(),
                        recipient,
                        message.msg_type.as_str(),
                        message.priority as i64,
                        payload,
                        created_at,
                        expires_at,
                    ],
                )?;
                ids.push(id);
            }
        }

        for recipient in &recipients {
            if let Some(notify) = self.notifiers.get(recipient.as_str()) {
                notify.notify_waiters();
            }
        }
        Ok(ids)
    }

    /// Atomically claim up to `max` pending messages for `to_agent`,
    /// ordered urgent-first then FIFO. Claimed rows move to in-flight.
    pub async fn receive(
        &self,
        to_agent: &AgentId,
        max: usize,
    ) -> Result<Vec<Message>, CoordinationError> {
        let now = now_ts();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "UPDATE messages SET status = 'in-flight', processed_at = ?1
             WHERE id IN (
                 SELECT id FROM messages
                 WHERE to_agent = ?2 AND status = 'pending'
                   AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?3)
             RETURNING id, from_agent, to_agent, msg_type, priority, payload,
                       status, created_at, processed_at, retries, expires_at",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![now, to_agent.as_str(), max as i64],
            row_to_message,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        // UPDATE … RETURNING does not guarantee ordering; restore it.
        messages.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(messages)
    }

    /// Blocking receive: wait until a message arrives for `to_agent`, the
    /// timeout lapses, or shutdown is requested. Falls back to periodic
    /// polling as a liveness safeguard.
    pub async fn receive_wait(
        &self,
        to_agent: &AgentId,
        max: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>, CoordinationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.notifier(to_agent.as_str());
        loop {
            let messages = self.receive(to_agent, max).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || cancel.is_cancelled() {
                return Ok(Vec::new());
            }
            let wait = remaining.min(self.poll_interval);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }

    /// Acknowledge successful processing: in-flight → acked.
    pub async fn ack(&self, id: MessageId) -> Result<(), CoordinationError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE messages SET status = 'acked', processed_at = ?1
             WHERE id = ?2 AND status = 'in-flight'",
            rusqlite::params![now_ts(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(CoordinationError::NotInFlight(id.to_string()));
        }
        Ok(())
    }

    /// Report failed processing: in-flight → failed, with a dead-letter row.
    pub async fn fail(&self, id: MessageId, reason: &str) -> Result<(), CoordinationError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE messages
             SET status = 'failed', processed_at = ?1, retries = retries + 1
             WHERE id = ?2 AND status = 'in-flight'",
            rusqlite::params![now_ts(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(CoordinationError::NotInFlight(id.to_string()));
        }
        conn.execute(
            "INSERT INTO dead_letter (message_id, reason, failed_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id.to_string(), reason, now_ts()],
        )?;
        Ok(())
    }

    /// One sweep pass: requeue stale in-flight messages, terminally fail
    /// messages over the retry cap, expire pending messages past their TTL.
    pub async fn sweep(&self) -> Result<SweepReport, CoordinationError> {
        let now = now_ts();
        let stale_cutoff = ts_ago(self.visibility_timeout);
        let mut report = SweepReport::default();

        let conn = self.conn.lock().await;

        // Stale in-flight over the retry cap: terminal failure.
        {
            let exhausted: Vec<String> = {
                let mut stmt = conn.prepare(
                    "UPDATE messages
                     SET status = 'failed', retries = retries + 1
                     WHERE status = 'in-flight' AND processed_at < ?1 AND retries + 1 > ?2
                     RETURNING id",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![stale_cutoff, self.max_retries as i64],
                    |row| row.get::<_, String>(0),
                )?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                ids
            };
            for id in exhausted {
                conn.execute(
                    "INSERT INTO dead_letter (message_id, reason, failed_at)
                     VALUES (?1, 'visibility timeout, retries exhausted', ?2)",
                    rusqlite::params![id, now],
                )?;
                report.failed += 1;
            }
        }

        // Remaining stale in-flight: back to pending for redelivery.
        report.requeued = conn.execute(
            "UPDATE messages
             SET status = 'pending', processed_at = NULL, retries = retries + 1
             WHERE status = 'in-flight' AND processed_at < ?1",
            rusqlite::params![stale_cutoff],
        )?;

        // Expired pending messages: terminal failure.
        {
            let expired: Vec<String> = {
                let mut stmt = conn.prepare(
                    "UPDATE messages SET status = 'failed'
                     WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1
                     RETURNING id",
                )?;
                let rows =
                    stmt.query_map(rusqlite::params![now], |row| row.get::<_, String>(0))?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row?);
                }
                ids
            };
            for id in expired {
                conn.execute(
                    "INSERT INTO dead_letter (message_id, reason, failed_at)
                     VALUES (?1, 'expired', ?2)",
                    rusqlite::params![id, now],
                )?;
                report.expired += 1;
            }
        }

        if report.requeued + report.failed + report.expired > 0 {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                expired = report.expired,
                "message bus sweep"
            );
        }
        Ok(report)
    }

    /// Background sweeper loop at half the visibility timeout.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancelToken) {
        let period = (self.visibility_timeout / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => break,
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "message bus sweep failed");
            }
        }
    }

    /// Queue depths for introspection.
    pub async fn stats(&self) -> Result<QueueStats, CoordinationError> {
        let conn = self.conn.lock().await;
        let mut stats = QueueStats::default();
        {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "in-flight" => stats.in_flight = count,
                    "acked" => stats.acked = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
        }
        {
            let mut stmt = conn.prepare(
                "SELECT priority, COUNT(*) FROM messages WHERE status = 'pending' GROUP BY priority",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (priority, count) = row?;
                stats
                    .by_priority
                    .insert(MessagePriority::from_i64(priority).as_str().to_string(), count);
            }
        }
        stats.dead_letter =
            conn.query_row("SELECT COUNT(*) FROM dead_letter", [], |row| row.get(0))?;
        Ok(stats)
    }
}

type RowResult = Result<Message, CoordinationError>;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowResult> {
    let id_str: String = row.get(0)?;
    let from: String = row.get(1)?;
    let to: String = row.get(2)?;
    let type_str: String = row.get(3)?;
    let priority: i64 = row.get(4)?;
    let payload_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let processed_at: Option<String> = row.get(8)?;
    let retries: i64 = row.get(9)?;
    let expires_at: Option<String> = row.get(10)?;

    Ok((|| -> RowResult {
        Ok(Message {
            id: id_str
                .parse()
                .map_err(|e: uuid::Error| CoordinationError::Serialization(e.to_string()))?,
            from_agent: AgentId::new(from),
            to_agent: to,
            msg_type: type_str
                .parse()
                .map_err(CoordinationError::Serialization)?,
            priority: MessagePriority::from_i64(priority),
            payload: serde_json::from_str(&payload_str)?,
            status: status_str
                .parse()
                .map_err(CoordinationError::Serialization)?,
            created_at,
            processed_at,
            retries: retries as u32,
            expires_at,
        })
    })())
}
