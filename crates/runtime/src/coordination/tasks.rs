//! Task coordination: lifecycle, intelligent assignment, dependencies and
//! retries.
//!
//! Tasks flow `pending → assigned → running → completed | failed`, with a
//! re-queue back to pending while retries remain. Assignment scores every
//! online, non-overloaded agent by capability coverage, role fit, track
//! record and load; a task with unmet dependencies stays pending, and a
//! terminally failed parent fails its dependents.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{
    AgentId, AgentRole, CoordinationError, MessagePriority, Payload, TaskId, TaskStatus,
};

use super::registry::AgentRegistry;

/// Default score below which a task stays pending.
const DEFAULT_SCORE_FLOOR: f64 = 1.0;
/// Default retry budget before terminal failure.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// One coordinated task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub description: String,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_role: Option<AgentRole>,
    pub priority: MessagePriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_agent: Option<AgentId>,
    pub retries: u32,
    pub depends_on: Vec<TaskId>,
    pub result: Payload,
    pub failure_reason: Option<String>,
}

/// Specification for a new task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_role: Option<AgentRole>,
    pub priority: MessagePriority,
    pub deadline: Option<DateTime<Utc>>,
    pub depends_on: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            preferred_role: None,
            priority: MessagePriority::Normal,
            deadline: None,
            depends_on: Vec::new(),
        }
    }

    pub fn capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn role(mut self, role: AgentRole) -> Self {
        self.preferred_role = Some(role);
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, parents: Vec<TaskId>) -> Self {
        self.depends_on = parents;
        self
    }
}

type TaskCallback = Box<dyn Fn(&Task) + Send + Sync>;

/// The task coordinator.
pub struct TaskCoordinator {
    registry: Arc<AgentRegistry>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    max_retries: u32,
    score_floor: f64,
    on_completed: parking_lot::Mutex<Option<TaskCallback>>,
    on_failed: parking_lot::Mutex<Option<TaskCallback>>,
}

impl TaskCoordinator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            tasks: RwLock::new(HashMap::new()),
            max_retries: DEFAULT_MAX_RETRIES,
            score_floor: DEFAULT_SCORE_FLOOR,
            on_completed: parking_lot::Mutex::new(None),
            on_failed: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Invoked synchronously inside the coordinator when a task completes.
    pub fn on_completed<F>(&self, callback: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        *self.on_completed.lock() = Some(Box::new(callback));
    }

    /// Invoked synchronously when a task fails terminally.
    pub fn on_failed<F>(&self, callback: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        *self.on_failed.lock() = Some(Box::new(callback));
    }

    /// Create a task in `pending`.
    pub async fn submit(&self, spec: TaskSpec) -> TaskId {
        let task = Task {
            id: TaskId::new(),
            task_type: spec.task_type,
            description: spec.description,
            required_capabilities: spec.required_capabilities,
            preferred_role: spec.preferred_role,
            priority: spec.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            deadline: spec.deadline,
            assigned_agent: None,
            retries: 0,
            depends_on: spec.depends_on,
            result: Payload::new(),
            failure_reason: None,
        };
        let id = task.id;
        self.tasks.write().await.insert(id, task);
        tracing::debug!(task = %id, "task submitted");
        id
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<Task> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        list
    }

    /// Number of assigned or running tasks per agent.
    async fn active_counts(&self) -> HashMap<AgentId, usize> {
        let tasks = self.tasks.read().await;
        let mut counts: HashMap<AgentId, usize> = HashMap::new();
        for task in tasks.values() {
            if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                if let Some(agent) = &task.assigned_agent {
                    *counts.entry(agent.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Try to assign every eligible pending task. Returns the assignments
    /// made as `(task, agent)` pairs.
    pub async fn assign_pending(&self) -> Vec<(TaskId, AgentId)> {
        // Snapshot eligibility without holding the task lock across the
        // registry scoring calls.
        let candidates: Vec<TaskId> = {
            let tasks = self.tasks.read().await;
            let mut pending: Vec<&Task> = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .collect();
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            pending.iter().map(|t| t.id).collect()
        };

        let mut assignments = Vec::new();
        for id in candidates {
            match self.dependency_state(id).await {
                DependencyState::Ready => {}
                DependencyState::Waiting => continue,
                DependencyState::ParentFailed(parent) => {
                    let reason = format!("dependency {parent} failed");
                    let _ = self.fail_terminally(id, &reason).await;
                    continue;
                }
            }

            let (caps, role) = {
                let tasks = self.tasks.read().await;
                let Some(task) = tasks.get(&id) else { continue };
                (task.required_capabilities.clone(), task.preferred_role)
            };
            let active = self.active_counts().await;
            let Some((agent, score)) = self
                .registry
                .select_for_task(&caps, role, &active, self.score_floor)
                .await
            else {
                continue;
            };

            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Assigned;
                    task.assigned_agent = Some(agent.clone());
                    tracing::info!(task = %id, agent = %agent, score, "task assigned");
                    assignments.push((id, agent));
                }
            }
        }
        assignments
    }

    /// Mark an assigned task as running.
    pub async fn mark_running(&self, id: TaskId) -> Result<(), CoordinationError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Assigned {
            return Err(CoordinationError::InvalidTransition {
                from: format!("{:?}", task.status),
                to: "Running".to_string(),
            });
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    /// Complete a task with its result map.
    pub async fn complete(&self, id: TaskId, result: Payload) -> Result<(), CoordinationError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                return Err(CoordinationError::InvalidTransition {
                    from: format!("{:?}", task.status),
                    to: "Completed".to_string(),
                });
            }
            task.status = TaskStatus::Completed;
            task.result = result;
            task.clone()
        };

        if let Some(agent) = &task.assigned_agent {
            let _ = self.registry.record_task_result(agent, true).await;
        }
        if let Some(callback) = self.on_completed.lock().as_ref() {
            callback(&task);
        }
        tracing::info!(task = %id, "task completed");
        Ok(())
    }

    /// Report a failure. The task re-queues as pending while retries remain,
    /// otherwise it fails terminally and drags its dependents down with it.
    pub async fn fail(&self, id: TaskId, reason: &str) -> Result<(), CoordinationError> {
        let (terminal, agent) = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| CoordinationError::TaskNotFound(id.to_string()))?;
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                return Err(CoordinationError::InvalidTransition {
                    from: format!("{:?}", task.status),
                    to: "Failed".to_string(),
                });
            }
            let agent = task.assigned_agent.clone();
            if task.retries < self.max_retries {
                task.retries += 1;
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                tracing::warn!(task = %id, retry = task.retries, reason, "task re-queued");
                (false, agent)
            } else {
                (true, agent)
            }
        };

        if let Some(agent) = &agent {
            let _ = self.registry.record_task_result(agent, false).await;
        }
        if terminal {
            self.fail_terminally(id, reason).await?;
        }
        Ok(())
    }

    /// Terminal failure: mark failed, invoke the callback, cascade to
    /// dependents.
    async fn fail_terminally(&self, id: TaskId, reason: &str) -> Result<(), CoordinationError> {
        let mut worklist = vec![(id, reason.to_string())];
        while let Some((failed_id, reason)) = worklist.pop() {
            let task = {
                let mut tasks = self.tasks.write().await;
                let Some(task) = tasks.get_mut(&failed_id) else {
                    continue;
                };
                if task.status == TaskStatus::Failed {
                    continue;
                }
                task.status = TaskStatus::Failed;
                task.failure_reason = Some(reason.clone());
                task.clone()
            };
            tracing::error!(task = %failed_id, reason = %reason, "task failed terminally");
            if let Some(callback) = self.on_failed.lock().as_ref() {
                callback(&task);
            }

            // Dependents of a terminally failed task can never run.
            let dependents: Vec<TaskId> = {
                let tasks = self.tasks.read().await;
                tasks
                    .values()
                    .filter(|t| {
                        t.depends_on.contains(&failed_id)
                            && !matches!(t.status, TaskStatus::Completed | TaskStatus::Failed)
                    })
                    .map(|t| t.id)
                    .collect()
            };
            for dependent in dependents {
                worklist.push((dependent, format!("dependency {failed_id} failed")));
            }
        }
        Ok(())
    }

    async fn dependency_state(&self, id: TaskId) -> DependencyState {
        let tasks = self.tasks.read().await;
        let Some(task) = tasks.get(&id) else {
            return DependencyState::Waiting;
        };
        for parent in &task.depends_on {
            match tasks.get(parent).map(|p| p.status) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) => return DependencyState::ParentFailed(*parent),
                // Unknown parents keep the task parked rather than running
                // it with unmet preconditions.
                _ => return DependencyState::Waiting,
            }
        }
        DependencyState::Ready
    }
}

enum DependencyState {
    Ready,
    Waiting,
    ParentFailed(TaskId),
}
