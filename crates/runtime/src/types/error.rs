//! Error types for the Anima runtime.
//!
//! Every failure in the runtime maps to one of the component error enums
//! below; [`RuntimeError`] is the roll-up used at composition seams. The
//! taxonomy mirrors the recovery policy: validation errors are surfaced and
//! never retried, transient I/O is retried at the owning layer, policy
//! rejections (rate limit, budget, open circuit) are skipped by callers, and
//! only startup invariant violations terminate the process.

use thiserror::Error;

/// Main runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("startup validation error: {0}")]
    Startup(#[from] StartupError),

    #[error("episodic store error: {0}")]
    Episodic(#[from] EpisodicError),

    #[error("vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unknown config field `{field}` in section `{section}` (strict mode)")]
    UnknownField { section: String, field: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// A single failed startup check.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("startup check `{check}` failed: {reason}")]
    CheckFailed { check: String, reason: String },

    #[error("{failed} of {total} startup checks failed")]
    ValidationFailed { failed: usize, total: usize },
}

/// Episodic store errors. Write-path validation failures are not surfaced to
/// callers (`add_episode` returns `None`); these cover open/query failures.
#[derive(Error, Debug)]
pub enum EpisodicError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("archive would lose data: {0}")]
    ArchiveInvariant(String),
}

impl From<rusqlite::Error> for EpisodicError {
    fn from(e: rusqlite::Error) -> Self {
        EpisodicError::Sqlite(e.to_string())
    }
}

/// Vector store errors.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
}

impl From<rusqlite::Error> for VectorError {
    fn from(e: rusqlite::Error) -> Self {
        VectorError::Sqlite(e.to_string())
    }
}

/// Typed outcome of a protected LLM call. Callers treat every non-`Ok`
/// variant as "no answer this tick" and continue.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("rate limited on operation `{operation}`")]
    RateLimited { operation: String },

    #[error("circuit open for `{dependency}`, recovery in {recovery_remaining_ms} ms")]
    CircuitOpen {
        dependency: String,
        recovery_remaining_ms: u64,
    },

    #[error("per-tick budget exhausted for operation `{operation}`")]
    BudgetExhausted { operation: String },

    #[error("transient failure after {attempts} attempts: {last_error}")]
    TransientFailed { attempts: u32, last_error: String },

    #[error("fatal llm error: {0}")]
    Fatal(String),

    #[error("call cancelled")]
    Cancelled,
}

/// Multi-agent coordination errors (registry, message bus, tasks, consensus).
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("registry io error: {0}")]
    RegistryIo(String),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentIdString),

    #[error("message {0} is not in-flight")]
    NotInFlight(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("proposal {0} is no longer active")]
    ProposalClosed(String),
}

type AgentIdString = String;

impl From<rusqlite::Error> for CoordinationError {
    fn from(e: rusqlite::Error) -> Self {
        CoordinationError::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::Serialization(e.to_string())
    }
}

/// Tick scheduler errors. Step failures never surface here; the uniform step
/// error boundary absorbs them.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("step `{0}` is already registered")]
    DuplicateStep(String),

    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Shutdown coordination errors.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("shutdown hook `{hook}` exceeded its {timeout_ms} ms timeout")]
    HookTimeout { hook: String, timeout_ms: u64 },

    #[error("total shutdown budget of {timeout_ms} ms exceeded with {remaining} hooks pending")]
    DrainTimeout { timeout_ms: u64, remaining: usize },
}
