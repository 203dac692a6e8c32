//! Embedding store with cosine-similarity search, backed by SQLite.
//!
//! Vectors are validated (fixed dimension, finite values), unit-normalized
//! at insertion and stored as little-endian f32 blobs, so similarity search
//! is a plain dot product. Old low-value records are evicted by age;
//! a protected-id set preserves embeddings tied to episodes the caller
//! deems important.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;

use crate::health::{Healthcheck, HealthSample};
use crate::types::VectorError;

/// Unit-norm tolerance accepted by the integrity scan.
const NORM_EPSILON: f32 = 1e-4;
/// Inner SQLite busy timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Deletions above this size trigger a VACUUM.
const VACUUM_THRESHOLD: usize = 64;

/// One search hit, best first.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub episode_id: Option<i64>,
    pub event_type: String,
    pub text: String,
    pub score: f32,
    pub created_at: f64,
}

/// Result of an integrity scan.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub malformed: usize,
}

/// Fixed-dimension embedding store.
pub struct VectorStore {
    conn: tokio::sync::Mutex<Connection>,
    dim: usize,
}

impl VectorStore {
    /// Open (or create) the store at `path` with embedding dimension `dim`.
    pub fn open(path: &Path, dim: usize) -> Result<Self, VectorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VectorError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_connection(&conn, dim)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            dim,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(dim: usize) -> Result<Self, VectorError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, dim)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            dim,
        })
    }

    fn init_connection(conn: &Connection, dim: usize) -> Result<(), VectorError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                id         INTEGER PRIMARY KEY,
                episode_id INTEGER,
                event_type TEXT NOT NULL,
                text       TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                created_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_episode ON embeddings(episode_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_event_type ON embeddings(event_type);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('dim', ?1)",
            rusqlite::params![dim.to_string()],
        )?;
        Ok(())
    }

    /// The embedding dimension recorded in an existing store file, if any.
    pub fn stored_dim(path: &Path) -> Option<usize> {
        let conn = Connection::open(path).ok()?;
        conn.query_row("SELECT value FROM meta WHERE key = 'dim'", [], |row| {
            row.get::<_, String>(0)
        })
        .ok()?
        .parse()
        .ok()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Validate, unit-normalize and insert an embedding. Returns the new row
    /// id, or `None` (with an error-class log) when validation fails.
    pub async fn add(
        &self,
        episode_id: Option<i64>,
        event_type: &str,
        text: &str,
        embedding: &[f32],
    ) -> Option<i64> {
        let unit = match normalize(embedding, self.dim) {
            Ok(v) => v,
            Err(reason) => {
                tracing::error!(event_type, %reason, "rejected embedding");
                return None;
            }
        };

        let blob = encode_f32le(&unit);
        let created_at = Utc::now().timestamp_micros() as f64 / 1e6;
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO embeddings (episode_id, event_type, text, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![episode_id, event_type, text, blob, created_at],
        );
        match result {
            Ok(_) => Some(conn.last_insert_rowid()),
            Err(e) => {
                tracing::error!(event_type, error = %e, "embedding write failed");
                None
            }
        }
    }

    /// Top-`k` most similar records by cosine similarity.
    ///
    /// Candidates are scanned newest-first (optionally bounded by
    /// `max_candidates` and filtered by `type_filter`); ties break by most
    /// recent, then highest id, so identical inputs are deterministic.
    pub async fn top_k(
        &self,
        query: &[f32],
        k: usize,
        type_filter: Option<&str>,
        max_candidates: Option<usize>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let unit = match normalize(query, self.dim) {
            Ok(v) => v,
            Err(reason) => {
                tracing::error!(%reason, "rejected query vector");
                return Ok(Vec::new());
            }
        };

        let limit = max_candidates.map(|n| n as i64).unwrap_or(-1);
        let conn = self.conn.lock().await;
        let mut scored: Vec<(SearchHit, i64)> = Vec::new();

        let mut scan = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let id: i64 = row.get(0)?;
            let episode_id: Option<i64> = row.get(1)?;
            let event_type: String = row.get(2)?;
            let text: String = row.get(3)?;
            let blob: Vec<u8> = row.get(4)?;
            let created_at: f64 = row.get(5)?;
            if let Some(candidate) = decode_f32le(&blob, self.dim) {
                let score = dot(&unit, &candidate);
                scored.push((
                    SearchHit {
                        episode_id,
                        event_type,
                        text,
                        score,
                        created_at,
                    },
                    id,
                ));
            }
            Ok(())
        };

        match type_filter {
            Some(event_type) => {
                let mut stmt = conn.prepare(
                    "SELECT id, episode_id, event_type, text, embedding, created_at
                     FROM embeddings WHERE event_type = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![event_type, limit])?;
                while let Some(row) = rows.next()? {
                    scan(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, episode_id, event_type, text, embedding, created_at
                     FROM embeddings
                     ORDER BY created_at DESC, id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                while let Some(row) = rows.next()? {
                    scan(row)?;
                }
            }
        }

        scored.sort_by(|(a, a_id), (b, b_id)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.created_at
                        .partial_cmp(&a.created_at)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b_id.cmp(a_id))
        });
        Ok(scored.into_iter().take(k).map(|(hit, _)| hit).collect())
    }

    /// Delete records older than `days`, preserving ids in `protected`
    /// (embeddings tied to episodes the caller wants kept). Returns the
    /// number of rows deleted.
    pub async fn cleanup(&self, days: u32, protected: &[i64]) -> Result<usize, VectorError> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days)))
            .timestamp_micros() as f64
            / 1e6;
        let mut conn = self.conn.lock().await;
        let deleted = {
            let tx = conn.transaction()?;
            let deleted = if protected.is_empty() {
                tx.execute(
                    "DELETE FROM embeddings WHERE created_at < ?1",
                    rusqlite::params![cutoff],
                )?
            } else {
                let placeholders = vec!["?"; protected.len()].join(",");
                let sql = format!(
                    "DELETE FROM embeddings WHERE created_at < ?1
                     AND (episode_id IS NULL OR episode_id NOT IN ({placeholders}))"
                );
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(cutoff)];
                for id in protected {
                    params.push(Box::new(*id));
                }
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                tx.execute(&sql, param_refs.as_slice())?
            };
            tx.commit()?;
            deleted
        };

        if deleted >= VACUUM_THRESHOLD {
            conn.execute_batch("VACUUM")?;
        }
        if deleted > 0 {
            tracing::info!(deleted, days, "vector cleanup complete");
        }
        Ok(deleted)
    }

    /// Detach all records from an episode, e.g. during a rebuild.
    pub async fn detach_episode(&self, episode_id: i64) -> Result<usize, VectorError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE embeddings SET episode_id = NULL WHERE episode_id = ?1",
            rusqlite::params![episode_id],
        )?;
        Ok(changed)
    }

    pub async fn count(&self) -> Result<i64, VectorError> {
        let conn = self.conn.lock().await;
        let count = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Scan all rows for malformed blobs (wrong length, non-finite values,
    /// non-unit norm).
    pub async fn validate(&self) -> Result<IntegrityReport, VectorError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, embedding FROM embeddings")?;
        let mut rows = stmt.query([])?;
        let mut checked = 0usize;
        let mut malformed = 0usize;
        while let Some(row) = rows.next()? {
            checked += 1;
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let ok = decode_f32le(&blob, self.dim)
                .map(|v| {
                    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                    (norm - 1.0).abs() <= NORM_EPSILON
                })
                .unwrap_or(false);
            if !ok {
                malformed += 1;
                tracing::warn!(id, "malformed embedding blob");
            }
        }
        Ok(IntegrityReport { checked, malformed })
    }
}

/// Validate dimension and finiteness, then scale to unit length.
fn normalize(vector: &[f32], dim: usize) -> Result<Vec<f32>, String> {
    if vector.len() != dim {
        return Err(format!("dimension mismatch: got {}, want {dim}", vector.len()));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err("vector contains NaN or Inf".to_string());
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        Ok(vector.iter().map(|x| x / norm).collect())
    } else {
        Ok(vector.to_vec())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn encode_f32le(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn decode_f32le(blob: &[u8], dim: usize) -> Option<Vec<f32>> {
    if blob.len() != dim * 4 {
        return None;
    }
    let mut vector = Vec::with_capacity(dim);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return None;
        }
        vector.push(value);
    }
    Some(vector)
}

#[async_trait]
impl Healthcheck for VectorStore {
    fn name(&self) -> &str {
        "vector"
    }

    async fn health(&self) -> HealthSample {
        match self.count().await {
            Ok(count) => HealthSample::healthy("vector store reachable")
                .with_detail("embeddings", count.into())
                .with_detail("dim", (self.dim as i64).into()),
            Err(e) => HealthSample::unhealthy(format!("vector store query failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[tokio::test]
    async fn add_normalizes_and_returns_id() {
        let store = VectorStore::open_in_memory(3).unwrap();
        let id = store.add(Some(1), "thought", "t", &[3.0, 0.0, 4.0]).await;
        assert!(id.is_some());

        let report = store.validate().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.malformed, 0);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        // dim 768, 7-element vector: rejected, search stays empty.
        let store = VectorStore::open_in_memory(768).unwrap();
        assert!(store
            .add(Some(1), "x", "t", &vec![0.0_f32; 7])
            .await
            .is_none());

        let query = vec![1.0_f32; 768];
        assert!(store.top_k(&query, 5, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nan_and_inf_are_rejected() {
        let store = VectorStore::open_in_memory(3).unwrap();
        assert!(store
            .add(None, "x", "t", &[0.0, f32::NAN, 1.0])
            .await
            .is_none());
        assert!(store
            .add(None, "x", "t", &[f32::INFINITY, 0.0, 1.0])
            .await
            .is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn top_k_orders_by_similarity() {
        let store = VectorStore::open_in_memory(4).unwrap();
        store.add(Some(1), "a", "exact", &basis(4, 0)).await.unwrap();
        store
            .add(Some(2), "a", "close", &[0.9, 0.1, 0.0, 0.0])
            .await
            .unwrap();
        store.add(Some(3), "a", "orthogonal", &basis(4, 1)).await.unwrap();

        let hits = store.top_k(&basis(4, 0), 2, None, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "exact");
        assert_eq!(hits[1].text, "close");
        assert!(hits[0].score > hits[1].score);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn type_filter_limits_candidates() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(1), "thought", "a", &[1.0, 0.0]).await.unwrap();
        store.add(Some(2), "dream", "b", &[1.0, 0.0]).await.unwrap();

        let hits = store
            .top_k(&[1.0, 0.0], 10, Some("dream"), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "b");
    }

    #[tokio::test]
    async fn ties_break_by_recency() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(1), "a", "older", &[1.0, 0.0]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.add(Some(2), "a", "newer", &[1.0, 0.0]).await.unwrap();

        let hits = store.top_k(&[1.0, 0.0], 2, None, None).await.unwrap();
        assert_eq!(hits[0].text, "newer");
        assert_eq!(hits[1].text, "older");
    }

    #[tokio::test]
    async fn invalid_query_returns_empty() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(1), "a", "x", &[1.0, 0.0]).await.unwrap();
        assert!(store
            .top_k(&[1.0], 5, None, None)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .top_k(&[f32::NAN, 0.0], 5, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cleanup_preserves_protected_ids() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(10), "a", "keep", &[1.0, 0.0]).await.unwrap();
        store.add(Some(11), "a", "drop", &[0.0, 1.0]).await.unwrap();
        store.add(None, "a", "standalone", &[1.0, 1.0]).await.unwrap();

        // Everything is "old" relative to a future cutoff of -1 days.
        let deleted = store.cleanup(0, &[10]).await.unwrap();
        assert_eq!(deleted, 2);
        let hits = store.top_k(&[1.0, 0.0], 10, None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "keep");
    }

    #[tokio::test]
    async fn cleanup_without_protection_drops_all_old() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(1), "a", "x", &[1.0, 0.0]).await.unwrap();
        store.add(Some(2), "a", "y", &[0.0, 1.0]).await.unwrap();
        let deleted = store.cleanup(0, &[]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn detach_nulls_episode_link() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(Some(5), "a", "x", &[1.0, 0.0]).await.unwrap();
        assert_eq!(store.detach_episode(5).await.unwrap(), 1);
        let hits = store.top_k(&[1.0, 0.0], 1, None, None).await.unwrap();
        assert_eq!(hits[0].episode_id, None);
    }

    #[tokio::test]
    async fn max_candidates_bounds_the_scan() {
        let store = VectorStore::open_in_memory(2).unwrap();
        // Insert a strong match first (older), then weak ones.
        store.add(Some(1), "a", "strong", &[1.0, 0.0]).await.unwrap();
        for i in 0..5 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            store
                .add(Some(10 + i), "a", "weak", &[0.1, 1.0])
                .await
                .unwrap();
        }
        // Scanning only the 3 newest candidates misses the strong match.
        let hits = store.top_k(&[1.0, 0.0], 1, None, Some(3)).await.unwrap();
        assert_eq!(hits[0].text, "weak");
    }

    #[tokio::test]
    async fn stored_dim_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.db");
        {
            let _store = VectorStore::open(&path, 16).unwrap();
        }
        assert_eq!(VectorStore::stored_dim(&path), Some(16));
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let store = VectorStore::open_in_memory(2).unwrap();
        store.add(None, "a", "x", &[1.0, 0.0]).await.unwrap();
        let sample = store.health().await;
        assert!(sample.healthy);
        assert_eq!(sample.details["embeddings"], 1);
        assert_eq!(sample.details["dim"], 2);
    }
}
