//! Append-only episodic log backed by SQLite.
//!
//! Every observed or produced happening is one immutable `episodes` row.
//! Write failures are themselves recorded in the `errors` table where
//! possible and never surface to step code: `add_episode` returns `None`
//! instead of erroring. Rows older than the archive threshold move into
//! monthly sibling databases and are only deleted once the copy is
//! committed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::health::{Healthcheck, HealthSample};
use crate::types::{EpisodicError, Outcome, Payload};

/// Descriptions are truncated to this many bytes before insertion.
const MAX_DESCRIPTION_BYTES: usize = 1024;
/// Serialized payloads above this bound are rejected as validation failures.
const MAX_DATA_BYTES: usize = 8192;
/// Inner SQLite busy timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sortable timestamp format with sub-second precision, stable width.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One immutable episode row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Episode {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub description: String,
    pub outcome: Outcome,
    pub data: Payload,
}

/// Result of one archive run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArchiveReport {
    pub archived: u64,
    pub months: Vec<String>,
    pub remaining: i64,
}

/// Append-only episodic store. One per agent process.
pub struct EpisodicStore {
    conn: tokio::sync::Mutex<Connection>,
    archive_dir: PathBuf,
    /// Last emitted timestamp; writes clamp to it so one writer's
    /// timestamps are monotonic non-decreasing.
    last_ts: parking_lot::Mutex<String>,
}

impl EpisodicStore {
    /// Open (or create) the store at `path`, with archives in `archive_dir`.
    pub fn open(path: &Path, archive_dir: &Path) -> Result<Self, EpisodicError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EpisodicError::Sqlite(format!("create dir: {e}")))?;
        }
        std::fs::create_dir_all(archive_dir)
            .map_err(|e| EpisodicError::Sqlite(format!("create archive dir: {e}")))?;
        let conn = Connection::open(path)?;
        // WAL mode for concurrent access; meaningless for in-memory stores.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            archive_dir: archive_dir.to_path_buf(),
            last_ts: parking_lot::Mutex::new(String::new()),
        })
    }

    /// In-memory store for tests; archives go to a temp directory.
    pub fn open_in_memory(archive_dir: &Path) -> Result<Self, EpisodicError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        std::fs::create_dir_all(archive_dir)
            .map_err(|e| EpisodicError::Sqlite(format!("create archive dir: {e}")))?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            archive_dir: archive_dir.to_path_buf(),
            last_ts: parking_lot::Mutex::new(String::new()),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), EpisodicError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                id          INTEGER PRIMARY KEY,
                timestamp   TEXT NOT NULL,
                event_type  TEXT NOT NULL,
                description TEXT NOT NULL,
                outcome     TEXT NOT NULL,
                data        TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS errors (
                id          INTEGER PRIMARY KEY,
                timestamp   TEXT NOT NULL,
                event_type  TEXT NOT NULL,
                description TEXT NOT NULL,
                data        TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_event_type ON episodes(event_type);
            CREATE INDEX IF NOT EXISTS idx_episodes_outcome ON episodes(outcome);
            CREATE INDEX IF NOT EXISTS idx_episodes_type_outcome
                ON episodes(event_type, outcome);
            CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_errors_timestamp ON errors(timestamp);",
        )?;
        Ok(())
    }

    /// Next timestamp, clamped to be non-decreasing for this writer.
    fn next_timestamp(&self) -> String {
        let now = Utc::now().format(TS_FORMAT).to_string();
        let mut last = self.last_ts.lock();
        if now > *last {
            *last = now;
        }
        last.clone()
    }

    /// Append one episode. Returns the new row id, or `None` on a validation
    /// or write failure, never an error to the caller.
    pub async fn add_episode(
        &self,
        event_type: &str,
        description: &str,
        outcome: Outcome,
        data: Option<Payload>,
    ) -> Option<i64> {
        let description = description.trim();
        if description.is_empty() {
            tracing::error!(event_type, "rejected episode with empty description");
            self.try_record_error(event_type, "empty description", None)
                .await;
            return None;
        }
        let description = truncate_utf8(description, MAX_DESCRIPTION_BYTES);

        let data = data.unwrap_or_default();
        let encoded = match serde_json::to_string(&data) {
            Ok(s) if s.len() <= MAX_DATA_BYTES => s,
            Ok(s) => {
                tracing::error!(
                    event_type,
                    bytes = s.len(),
                    "rejected episode with oversized payload"
                );
                self.try_record_error(event_type, "oversized payload", None)
                    .await;
                return None;
            }
            Err(e) => {
                tracing::error!(event_type, error = %e, "episode payload failed to encode");
                self.try_record_error(event_type, &format!("payload encode: {e}"), None)
                    .await;
                return None;
            }
        };

        let timestamp = self.next_timestamp();
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO episodes (timestamp, event_type, description, outcome, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![timestamp, event_type, description, outcome.as_str(), encoded],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid()),
            Err(e) => {
                tracing::error!(event_type, error = %e, "episode write failed");
                let _ = conn.execute(
                    "INSERT INTO errors (timestamp, event_type, description, data)
                     VALUES (?1, ?2, ?3, '{}')",
                    rusqlite::params![timestamp, event_type, format!("write failed: {e}")],
                );
                None
            }
        }
    }

    /// Record a failure row directly in `errors`. Best-effort.
    pub async fn try_record_error(
        &self,
        event_type: &str,
        description: &str,
        data: Option<Payload>,
    ) {
        let encoded = data
            .and_then(|d| serde_json::to_string(&d).ok())
            .unwrap_or_else(|| "{}".to_string());
        let timestamp = self.next_timestamp();
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute(
            "INSERT INTO errors (timestamp, event_type, description, data)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![timestamp, event_type, description, encoded],
        ) {
            tracing::error!(error = %e, "failed to record error row");
        }
    }

    /// The `n` most recent episodes, newest first.
    pub async fn recent(&self, n: usize) -> Result<Vec<Episode>, EpisodicError> {
        self.query(
            "SELECT id, timestamp, event_type, description, outcome, data
             FROM episodes ORDER BY timestamp DESC, id DESC LIMIT ?1",
            vec![Box::new(n as i64)],
        )
        .await
    }

    /// Most recent episodes of one type.
    pub async fn by_type(&self, event_type: &str, n: usize) -> Result<Vec<Episode>, EpisodicError> {
        self.query(
            "SELECT id, timestamp, event_type, description, outcome, data
             FROM episodes WHERE event_type = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            vec![Box::new(event_type.to_string()), Box::new(n as i64)],
        )
        .await
    }

    /// Most recent episodes with one outcome.
    pub async fn by_outcome(&self, outcome: Outcome, n: usize) -> Result<Vec<Episode>, EpisodicError> {
        self.query(
            "SELECT id, timestamp, event_type, description, outcome, data
             FROM episodes WHERE outcome = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            vec![Box::new(outcome.as_str().to_string()), Box::new(n as i64)],
        )
        .await
    }

    /// Episode ids with the given outcome, for cleanup protection sets.
    pub async fn ids_by_outcome(&self, outcome: Outcome) -> Result<Vec<i64>, EpisodicError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM episodes WHERE outcome = ?1")?;
        let rows = stmt.query_map(rusqlite::params![outcome.as_str()], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub async fn count(&self) -> Result<i64, EpisodicError> {
        let conn = self.conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        Ok(count)
    }

    pub async fn error_count(&self) -> Result<i64, EpisodicError> {
        let conn = self.conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM errors", [], |row| row.get(0))?;
        Ok(count)
    }

    async fn query(
        &self,
        sql: &str,
        params: Vec<Box<dyn rusqlite::ToSql + Send + Sync>>,
    ) -> Result<Vec<Episode>, EpisodicError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_episode)?;
        let mut episodes = Vec::new();
        for row in rows {
            episodes.push(row?);
        }
        Ok(episodes)
    }

    /// Move rows strictly older than `days` into monthly archive databases.
    ///
    /// Each month is one copy-then-delete transaction; interrupting between
    /// months leaves both databases consistent, and re-running is a no-op
    /// for already-archived rows. A count mismatch aborts the month with
    /// nothing deleted.
    pub async fn archive_older_than(&self, days: u32) -> Result<ArchiveReport, EpisodicError> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days)))
            .format(TS_FORMAT)
            .to_string();

        let mut conn = self.conn.lock().await;
        let months: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT strftime('%Y_%m', timestamp) FROM episodes
                 WHERE timestamp < ?1 ORDER BY 1",
            )?;
            let rows = stmt.query_map(rusqlite::params![cutoff], |row| row.get(0))?;
            let mut months = Vec::new();
            for row in rows {
                months.push(row?);
            }
            months
        };

        let mut archived_total = 0u64;
        for month in &months {
            let archive_path = self.archive_dir.join(format!("archive_{month}.db"));
            let archive_str = archive_path.display().to_string();
            conn.execute(
                "ATTACH DATABASE ?1 AS archive",
                rusqlite::params![archive_str],
            )?;

            let result = (|| -> Result<u64, EpisodicError> {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS archive.episodes (
                        id          INTEGER PRIMARY KEY,
                        timestamp   TEXT NOT NULL,
                        event_type  TEXT NOT NULL,
                        description TEXT NOT NULL,
                        outcome     TEXT NOT NULL,
                        data        TEXT NOT NULL DEFAULT '{}'
                    );",
                )?;
                let tx = conn.transaction()?;
                let copied = tx.execute(
                    "INSERT OR IGNORE INTO archive.episodes
                     SELECT id, timestamp, event_type, description, outcome, data
                     FROM main.episodes
                     WHERE timestamp < ?1 AND strftime('%Y_%m', timestamp) = ?2",
                    rusqlite::params![cutoff, month],
                )?;
                let deleted = tx.execute(
                    "DELETE FROM main.episodes
                     WHERE timestamp < ?1 AND strftime('%Y_%m', timestamp) = ?2
                       AND id IN (SELECT id FROM archive.episodes)",
                    rusqlite::params![cutoff, month],
                )?;
                if deleted > copied {
                    // Dropping the transaction rolls everything back.
                    return Err(EpisodicError::ArchiveInvariant(format!(
                        "month {month}: would delete {deleted} rows but copied only {copied}"
                    )));
                }
                tx.commit()?;
                Ok(deleted as u64)
            })();

            conn.execute_batch("DETACH DATABASE archive")?;
            match result {
                Ok(deleted) => {
                    archived_total += deleted;
                    tracing::info!(month = %month, rows = deleted, "archived episodes");
                }
                Err(e) => return Err(e),
            }
        }

        if archived_total > 0 {
            conn.execute_batch("VACUUM")?;
        }

        let remaining = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        Ok(ArchiveReport {
            archived: archived_total,
            months,
            remaining,
        })
    }

    /// Insert an episode with an explicit timestamp. Test and migration
    /// support; production writes go through [`EpisodicStore::add_episode`].
    pub async fn add_episode_at(
        &self,
        timestamp: DateTime<Utc>,
        event_type: &str,
        description: &str,
        outcome: Outcome,
    ) -> Result<i64, EpisodicError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO episodes (timestamp, event_type, description, outcome, data)
             VALUES (?1, ?2, ?3, ?4, '{}')",
            rusqlite::params![
                timestamp.format(TS_FORMAT).to_string(),
                event_type,
                description,
                outcome.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let outcome_str: String = row.get(4)?;
    let data_str: String = row.get(5)?;
    Ok(Episode {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        event_type: row.get(2)?,
        description: row.get(3)?,
        outcome: outcome_str.parse().unwrap_or(Outcome::Unknown),
        data: serde_json::from_str(&data_str).unwrap_or_default(),
    })
}

#[async_trait]
impl Healthcheck for EpisodicStore {
    fn name(&self) -> &str {
        "episodic"
    }

    async fn health(&self) -> HealthSample {
        match self.count().await {
            Ok(count) => HealthSample::healthy("episodic store reachable")
                .with_detail("episodes", count.into()),
            Err(e) => HealthSample::unhealthy(format!("episodic store query failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (EpisodicStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = EpisodicStore::open_in_memory(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn add_and_read_back() {
        let (store, _dir) = store();
        let id = store
            .add_episode("user.message", "hello there", Outcome::Neutral, None)
            .await
            .unwrap();
        assert!(id > 0);

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "user.message");
        assert_eq!(recent[0].description, "hello there");
        assert_eq!(recent[0].outcome, Outcome::Neutral);
    }

    #[tokio::test]
    async fn empty_description_is_rejected_and_logged() {
        let (store, _dir) = store();
        assert!(store
            .add_episode("thought", "   ", Outcome::Neutral, None)
            .await
            .is_none());
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.error_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn long_description_is_truncated() {
        let (store, _dir) = store();
        let long = "x".repeat(5000);
        store
            .add_episode("thought", &long, Outcome::Neutral, None)
            .await
            .unwrap();
        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent[0].description.len(), MAX_DESCRIPTION_BYTES);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (store, _dir) = store();
        let mut data = Payload::new();
        data.insert("blob".to_string(), serde_json::json!("y".repeat(20_000)));
        assert!(store
            .add_episode("thought", "big", Outcome::Neutral, Some(data))
            .await
            .is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn payload_round_trips() {
        let (store, _dir) = store();
        let mut data = Payload::new();
        data.insert("key".to_string(), serde_json::json!({"nested": [1, 2, 3]}));
        store
            .add_episode("action.shell", "ran ls", Outcome::Success, Some(data))
            .await
            .unwrap();
        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent[0].data["key"]["nested"][1], 2);
    }

    #[tokio::test]
    async fn filters_by_type_and_outcome() {
        let (store, _dir) = store();
        for i in 0..5 {
            store
                .add_episode("thought", &format!("t{i}"), Outcome::Neutral, None)
                .await
                .unwrap();
        }
        store
            .add_episode("action.shell", "failed op", Outcome::Failure, None)
            .await
            .unwrap();

        assert_eq!(store.by_type("thought", 10).await.unwrap().len(), 5);
        assert_eq!(store.by_type("thought", 3).await.unwrap().len(), 3);
        let failures = store.by_outcome(Outcome::Failure, 10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_type, "action.shell");
    }

    #[tokio::test]
    async fn count_matches_successful_adds() {
        let (store, _dir) = store();
        let mut successes = 0;
        for i in 0..10 {
            let desc = if i % 3 == 0 { "" } else { "fine" };
            if store
                .add_episode("thought", desc, Outcome::Neutral, None)
                .await
                .is_some()
            {
                successes += 1;
            }
        }
        assert_eq!(store.count().await.unwrap(), successes);
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let (store, _dir) = store();
        for i in 0..4 {
            store
                .add_episode("thought", &format!("n{i}"), Outcome::Neutral, None)
                .await
                .unwrap();
        }
        let recent = store.recent(4).await.unwrap();
        assert_eq!(recent[0].description, "n3");
        assert_eq!(recent[3].description, "n0");
    }

    #[tokio::test]
    async fn archive_moves_old_rows_and_preserves_total() {
        let (store, dir) = store();
        let now = Utc::now();
        // 100 episodes spanning 120 days: 70 older than the 90-day cutoff.
        for i in 0..100 {
            let age_days = (i * 120) / 100 + 1;
            store
                .add_episode_at(
                    now - chrono::Duration::days(age_days),
                    "thought",
                    &format!("e{i}"),
                    Outcome::Neutral,
                )
                .await
                .unwrap();
        }
        let before = store.count().await.unwrap();
        assert_eq!(before, 100);

        let report = store.archive_older_than(90).await.unwrap();
        let remaining = store.count().await.unwrap();
        assert_eq!(report.archived + remaining as u64, 100);
        assert!(report.archived > 0);
        assert_eq!(report.remaining, remaining);

        // Archived rows are present in the monthly databases.
        let mut archived_found = 0i64;
        for month in &report.months {
            let path = dir.path().join(format!("archive_{month}.db"));
            assert!(path.exists());
            let conn = Connection::open(&path).unwrap();
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))
                .unwrap();
            archived_found += count;
        }
        assert_eq!(archived_found as u64, report.archived);
    }

    #[tokio::test]
    async fn archive_is_idempotent() {
        let (store, _dir) = store();
        let now = Utc::now();
        for i in 0..10 {
            store
                .add_episode_at(
                    now - chrono::Duration::days(200),
                    "thought",
                    &format!("old{i}"),
                    Outcome::Neutral,
                )
                .await
                .unwrap();
        }
        let first = store.archive_older_than(90).await.unwrap();
        assert_eq!(first.archived, 10);
        let second = store.archive_older_than(90).await.unwrap();
        assert_eq!(second.archived, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn archive_with_nothing_old_is_noop() {
        let (store, _dir) = store();
        store
            .add_episode("thought", "fresh", Outcome::Neutral, None)
            .await
            .unwrap();
        let report = store.archive_older_than(90).await.unwrap();
        assert_eq!(report.archived, 0);
        assert!(report.months.is_empty());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timestamps_are_monotonic() {
        let (store, _dir) = store();
        for i in 0..20 {
            store
                .add_episode("thought", &format!("m{i}"), Outcome::Neutral, None)
                .await
                .unwrap();
        }
        let recent = store.recent(20).await.unwrap();
        let mut timestamps: Vec<&str> = recent.iter().map(|e| e.timestamp.as_str()).collect();
        timestamps.reverse();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test]
    async fn ids_by_outcome_returns_matching() {
        let (store, _dir) = store();
        store
            .add_episode("a", "ok", Outcome::Success, None)
            .await
            .unwrap();
        let failed = store
            .add_episode("b", "bad", Outcome::Failure, None)
            .await
            .unwrap();
        let ids = store.ids_by_outcome(Outcome::Failure).await.unwrap();
        assert_eq!(ids, vec![failed]);
    }

    #[tokio::test]
    async fn health_reports_count() {
        let (store, _dir) = store();
        store
            .add_episode("thought", "x", Outcome::Neutral, None)
            .await
            .unwrap();
        let sample = store.health().await;
        assert!(sample.healthy);
        assert_eq!(sample.details["episodes"], 1);
    }
}
