//! Durable registry of agent processes on this host.
//!
//! One JSON file holds every agent's record; writes serialize to a sibling
//! temp file and rename over the primary so concurrent readers never see a
//! torn file. Agents that stop heartbeating are marked offline by a
//! background pass but never removed.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::shutdown::CancelToken;
use crate::types::{AgentId, AgentRole, AgentStatus, CoordinationError};

/// Load score above which an agent is skipped during assignment.
const OVERLOAD_THRESHOLD: f64 = 0.9;

/// One registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub status: AgentStatus,
    /// Self-reported load in `[0, 1]`.
    pub load: f64,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default)]
    pub failed_tasks: u64,
}

impl AgentRecord {
    pub fn new(id: AgentId, name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            capabilities: BTreeSet::new(),
            endpoint: None,
            status: AgentStatus::Online,
            load: 0.0,
            last_heartbeat: Utc::now(),
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Fraction of finished tasks that succeeded; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed_tasks + self.failed_tasks;
        if finished == 0 {
            1.0
        } else {
            self.completed_tasks as f64 / finished as f64
        }
    }

    /// Heartbeat freshness in `[0, 1]`: 1.0 right after a beat, linearly
    /// decaying to 0.0 at the staleness timeout.
    pub fn freshness(&self, timeout: Duration) -> f64 {
        let elapsed = (Utc::now() - self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ratio = elapsed.as_secs_f64() / timeout.as_secs_f64().max(f64::EPSILON);
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

/// Query filter for [`AgentRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct RegistryFilter {
    pub role: Option<AgentRole>,
    pub capability: Option<String>,
    pub status: Option<AgentStatus>,
}

/// The on-disk agent registry.
pub struct AgentRegistry {
    path: PathBuf,
    heartbeat_timeout: Duration,
    state: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    /// Open the registry file, loading any existing records.
    pub fn open(path: &Path, heartbeat_timeout: Duration) -> Result<Self, CoordinationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoordinationError::RegistryIo(format!("create dir: {e}")))?;
        }
        let state = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| CoordinationError::RegistryIo(e.to_string()))?;
            let records: Vec<AgentRecord> = serde_json::from_str(&raw)?;
            records.into_iter().map(|r| (r.id.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            heartbeat_timeout,
            state: RwLock::new(state),
        })
    }

    /// Upsert a record and refresh its heartbeat.
    pub async fn register(&self, mut record: AgentRecord) -> Result<(), CoordinationError> {
        record.last_heartbeat = Utc::now();
        {
            let mut state = self.state.write().await;
            state.insert(record.id.clone(), record);
        }
        self.persist().await
    }

    pub async fn unregister(&self, id: &AgentId) -> Result<bool, CoordinationError> {
        let removed = self.state.write().await.remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Refresh a heartbeat with the agent's current load.
    pub async fn heartbeat(&self, id: &AgentId, load: f64) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.write().await;
            let record = state
                .get_mut(id)
                .ok_or_else(|| CoordinationError::AgentNotFound(id.to_string()))?;
            record.last_heartbeat = Utc::now();
            record.load = load.clamp(0.0, 1.0);
            if record.status == AgentStatus::Offline {
                record.status = AgentStatus::Online;
            }
        }
        self.persist().await
    }

    /// Update performance counters after a task finishes.
    pub async fn record_task_result(
        &self,
        id: &AgentId,
        success: bool,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.write().await;
            let record = state
                .get_mut(id)
                .ok_or_else(|| CoordinationError::AgentNotFound(id.to_string()))?;
            if success {
                record.completed_tasks += 1;
            } else {
                record.failed_tasks += 1;
            }
        }
        self.persist().await
    }

    pub async fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        self.state.read().await.get(id).cloned()
    }

    /// Records matching the filter, sorted by id for stable output.
    pub async fn list(&self, filter: &RegistryFilter) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        let mut records: Vec<AgentRecord> = state
            .values()
            .filter(|r| filter.role.map_or(true, |role| r.role == role))
            .filter(|r| {
                filter
                    .capability
                    .as_ref()
                    .map_or(true, |cap| r.capabilities.contains(cap))
            })
            .filter(|r| filter.status.map_or(true, |status| r.status == status))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Mark agents whose heartbeat is older than the timeout as offline.
    /// Returns how many statuses flipped.
    pub async fn mark_stale(&self) -> Result<usize, CoordinationError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let flipped = {
            let mut state = self.state.write().await;
            let mut flipped = 0;
            for record in state.values_mut() {
                if record.status != AgentStatus::Offline && record.last_heartbeat < cutoff {
                    record.status = AgentStatus::Offline;
                    flipped += 1;
                    tracing::info!(agent = %record.id, "agent marked offline (stale heartbeat)");
                }
            }
            flipped
        };
        if flipped > 0 {
            self.persist().await?;
        }
        Ok(flipped)
    }

    /// Background staleness pass, roughly every half timeout.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancelToken) {
        let period = self.heartbeat_timeout / 2;
        let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => break,
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.mark_stale().await {
                tracing::error!(error = %e, "registry staleness pass failed");
            }
        }
    }

    /// Pick the best online, non-overloaded agent for a task.
    ///
    /// `active_tasks` carries each agent's currently assigned/running task
    /// count (the task coordinator knows; plain callers pass an empty map).
    /// Returns `None` when no candidate scores above `score_floor`.
    pub async fn select_for_task(
        &self,
        required_capabilities: &BTreeSet<String>,
        preferred_role: Option<AgentRole>,
        active_tasks: &HashMap<AgentId, usize>,
        score_floor: f64,
    ) -> Option<(AgentId, f64)> {
        let state = self.state.read().await;
        let mut best: Option<(&AgentRecord, f64)> = None;
        for record in state.values() {
            if record.status != AgentStatus::Online || record.load > OVERLOAD_THRESHOLD {
                continue;
            }
            let active = active_tasks.get(&record.id).copied().unwrap_or(0);
            let score = score_agent(
                record,
                required_capabilities,
                preferred_role,
                active,
                self.heartbeat_timeout,
            );
            if score < score_floor {
                continue;
            }
            best = match best {
                None => Some((record, score)),
                Some((current, current_score)) => {
                    let replace = score > current_score
                        || (score == current_score
                            && (record.load < current.load
                                || (record.load == current.load && record.id < current.id)));
                    if replace {
                        Some((record, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
        best.map(|(record, score)| (record.id.clone(), score))
    }

    /// Serialize to a sibling temp file, then rename over the primary.
    async fn persist(&self) -> Result<(), CoordinationError> {
        let records: Vec<AgentRecord> = {
            let state = self.state.read().await;
            let mut records: Vec<AgentRecord> = state.values().cloned().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            records
        };
        let json = serde_json::to_string_pretty(&records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CoordinationError> {
            use std::io::Write;
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(parent)
                .map_err(|e| CoordinationError::RegistryIo(e.to_string()))?;
            tmp.write_all(json.as_bytes())
                .map_err(|e| CoordinationError::RegistryIo(e.to_string()))?;
            tmp.persist(&path)
                .map_err(|e| CoordinationError::RegistryIo(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| CoordinationError::RegistryIo(format!("blocking task: {e}")))?
    }
}

/// Assignment score for one candidate.
///
/// Idle agents, capability coverage, role fit, track record and heartbeat
/// freshness add; reported load subtracts.
pub fn score_agent(
    record: &AgentRecord,
    required_capabilities: &BTreeSet<String>,
    preferred_role: Option<AgentRole>,
    active_tasks: usize,
    heartbeat_timeout: Duration,
) -> f64 {
    let mut score = 0.0;

    if record.status == AgentStatus::Online && active_tasks == 0 {
        score += 2.0;
    }

    if required_capabilities.is_empty() {
        score += 5.0;
    } else {
        let matched = required_capabilities
            .iter()
            .filter(|cap| record.capabilities.contains(*cap))
            .count();
        score += 5.0 * matched as f64 / required_capabilities.len() as f64;
    }

    if preferred_role == Some(record.role) {
        score += 3.0;
    }

    score += 3.0 * record.success_rate();
    score += 2.0 * record.freshness(heartbeat_timeout);
    score -= 2.0 * record.load;
    score
}
