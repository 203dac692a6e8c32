//! Configuration management for the Anima runtime.
//!
//! A single YAML file configures every core component. Each section has
//! secure defaults so an empty file is a valid configuration; `strict: true`
//! additionally rejects unknown fields so typos fail fast at startup instead
//! of silently falling back to defaults.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::ConfigError;

/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "ANIMA_DATA_DIR";
/// Environment variable overriding the config file path.
pub const ENV_CONFIG: &str = "ANIMA_CONFIG";
/// Environment variable overriding the log filter.
pub const ENV_LOG: &str = "ANIMA_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent identity on this host.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Reject unknown configuration fields.
    #[serde(default)]
    pub strict: bool,
    /// Root of the on-disk layout (`data/` by default).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ticks: TicksConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub multi_agent: MultiAgentConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Identity of this agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable agent id, unique per registry file.
    pub id: String,
    /// Human-readable name used in the outbox and registry.
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "anima-main".to_string(),
            name: "Anima".to_string(),
        }
    }
}

/// Tick cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicksConfig {
    /// Fast (light) tick period in seconds.
    pub fast_tick_sec: f64,
    /// Slow (heavy) tick period in seconds.
    pub heavy_tick_sec: f64,
    /// Grace allowed to in-flight steps on cancellation or overrun.
    pub heavy_tick_grace_sec: f64,
}

impl Default for TicksConfig {
    fn default() -> Self {
        Self {
            fast_tick_sec: 1.0,
            heavy_tick_sec: 60.0,
            heavy_tick_grace_sec: 30.0,
        }
    }
}

/// LLM service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible service.
    pub base_url: String,
    pub chat_model: String,
    pub embed_model: String,
    /// Network timeout per attempt, in seconds.
    pub timeout_sec: f64,
    /// Chat calls allowed per slow tick.
    pub per_tick_chat_budget: u32,
    /// Embed calls allowed per slow tick.
    pub per_tick_embed_budget: u32,
    /// Embedding vector dimension; must match the vector store.
    pub embedding_dim: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            chat_model: "llama3".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            timeout_sec: 30.0,
            per_tick_chat_budget: 5,
            per_tick_embed_budget: 20,
            embedding_dim: 768,
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_seconds: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl_seconds: 300.0,
        }
    }
}

/// Token-bucket rate limits per operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Chat refill rate, tokens per second.
    pub chat_rate: f64,
    /// Chat burst capacity.
    pub chat_burst: u32,
    /// Embed refill rate, tokens per second.
    pub embed_rate: f64,
    /// Embed burst capacity.
    pub embed_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat_rate: 5.0,
            chat_burst: 10,
            embed_rate: 20.0,
            embed_burst: 50,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds to wait in open before probing.
    pub recovery_timeout_sec: f64,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_sec: 30.0,
            success_threshold: 2,
        }
    }
}

/// Memory maintenance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Episodes older than this are moved to monthly archives.
    pub archive_after_days: u32,
    /// Embeddings older than this are eligible for eviction.
    pub vector_cleanup_after_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            archive_after_days: 90,
            vector_cleanup_after_days: 30,
        }
    }
}

/// Multi-agent coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentConfig {
    pub enabled: bool,
    /// Seconds after which a silent agent is marked offline.
    pub heartbeat_timeout_sec: f64,
    /// Seconds an in-flight message stays hidden from other receivers.
    pub visibility_timeout_sec: f64,
    /// Redelivery attempts before a message is terminally failed.
    pub max_retries: u32,
    /// Liveness-fallback polling interval for blocking receives.
    pub poll_interval_sec: f64,
}

impl Default for MultiAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_timeout_sec: 60.0,
            visibility_timeout_sec: 60.0,
            max_retries: 3,
            poll_interval_sec: 2.0,
        }
    }
}

/// Health checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Aggregate result cache TTL in seconds.
    pub cache_ttl_sec: f64,
    /// Components whose ill health degrades the slow tick.
    pub critical_components: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cache_ttl_sec: 10.0,
            critical_components: vec!["llm".to_string(), "episodic".to_string()],
        }
    }
}

/// Shutdown drain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Total seconds allowed for the ordered hook drain.
    pub total_timeout_sec: f64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_sec: 30.0,
        }
    }
}

/// Read-only introspection surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8750,
        }
    }
}

impl Config {
    /// Load from a YAML file, applying environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Load from the `ANIMA_CONFIG` path if set, from `config_path` if it
    /// exists, or fall back to defaults.
    pub fn load_or_default(config_path: &Path) -> Result<Self, ConfigError> {
        let path = env::var(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_path.to_path_buf());
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse from a YAML string. Strict mode rejects unknown fields.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = if raw.trim().is_empty() {
            serde_yaml::Value::Mapping(Default::default())
        } else {
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        let mut config: Config =
            serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.strict {
            check_unknown_fields(&value)?;
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Cross-field sanity checks. Runs before the startup validator, which
    /// re-reports failures with per-check granularity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ticks.fast_tick_sec", self.ticks.fast_tick_sec),
            ("ticks.heavy_tick_sec", self.ticks.heavy_tick_sec),
            ("llm.timeout_sec", self.llm.timeout_sec),
            ("cache.ttl_seconds", self.cache.ttl_seconds),
            ("rate_limit.chat_rate", self.rate_limit.chat_rate),
            ("rate_limit.embed_rate", self.rate_limit.embed_rate),
            (
                "circuit_breaker.recovery_timeout_sec",
                self.circuit_breaker.recovery_timeout_sec,
            ),
        ];
        for (key, v) in positive {
            if v <= 0.0 || !v.is_finite() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("must be a positive number, got {v}"),
                });
            }
        }
        if self.llm.embedding_dim == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm.embedding_dim".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigError::InvalidValue {
                key: "circuit_breaker".to_string(),
                reason: "thresholds must be non-zero".to_string(),
            });
        }
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "agent.id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    // ── On-disk layout (all under data_dir) ──────────────────────────

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn episodic_db_path(&self) -> PathBuf {
        self.memory_dir().join("episodic.db")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.memory_dir().join("archives")
    }

    pub fn vector_db_path(&self) -> PathBuf {
        self.memory_dir().join("vector.db")
    }

    pub fn messages_db_path(&self) -> PathBuf {
        self.memory_dir().join("messages.db")
    }

    pub fn proposals_db_path(&self) -> PathBuf {
        self.memory_dir().join("proposals.db")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.memory_dir().join("registry.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.data_dir.join("inbox.txt")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.txt")
    }
}

/// Top-level and per-section field names recognized by [`Config`].
const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    ("agent", &["id", "name"]),
    ("strict", &[]),
    ("data_dir", &[]),
    (
        "ticks",
        &["fast_tick_sec", "heavy_tick_sec", "heavy_tick_grace_sec"],
    ),
    (
        "llm",
        &[
            "base_url",
            "chat_model",
            "embed_model",
            "timeout_sec",
            "per_tick_chat_budget",
            "per_tick_embed_budget",
            "embedding_dim",
        ],
    ),
    ("cache", &["max_size", "ttl_seconds"]),
    (
        "rate_limit",
        &["chat_rate", "chat_burst", "embed_rate", "embed_burst"],
    ),
    (
        "circuit_breaker",
        &[
            "failure_threshold",
            "recovery_timeout_sec",
            "success_threshold",
        ],
    ),
    ("memory", &["archive_after_days", "vector_cleanup_after_days"]),
    (
        "multi_agent",
        &[
            "enabled",
            "heartbeat_timeout_sec",
            "visibility_timeout_sec",
            "max_retries",
            "poll_interval_sec",
        ],
    ),
    ("health", &["cache_ttl_sec", "critical_components"]),
    ("shutdown", &["total_timeout_sec"]),
    ("api", &["enabled", "host", "port"]),
];

fn check_unknown_fields(value: &serde_yaml::Value) -> Result<(), ConfigError> {
    let serde_yaml::Value::Mapping(root) = value else {
        return Ok(());
    };
    let sections: HashSet<&str> = KNOWN_SECTIONS.iter().map(|(name, _)| *name).collect();

    for (key, section_value) in root {
        let Some(key) = key.as_str() else { continue };
        if !sections.contains(key) {
            return Err(ConfigError::UnknownField {
                section: "<root>".to_string(),
                field: key.to_string(),
            });
        }
        let known_fields = KNOWN_SECTIONS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, fields)| *fields)
            .unwrap_or(&[]);
        if known_fields.is_empty() {
            continue; // scalar section
        }
        if let serde_yaml::Value::Mapping(section) = section_value {
            for (field, _) in section {
                let Some(field) = field.as_str() else { continue };
                if !known_fields.contains(&field) {
                    return Err(ConfigError::UnknownField {
                        section: key.to_string(),
                        field: field.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}
