//! Startup validation: fail fast before any subsystem starts.
//!
//! Each check reports individually; fatal failures abort the process with a
//! non-zero exit, non-fatal ones are logged into the startup summary and
//! the agent runs degraded.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::Disks;

use crate::config::Config;
use crate::llm::LlmProvider;
use crate::memory::VectorStore;
use crate::types::StartupError;

/// Minimum free disk space under the data directory.
const DISK_FLOOR_BYTES: u64 = 1024 * 1024 * 1024;
/// SQLite version floor; `UPDATE … RETURNING` needs 3.35.
const SQLITE_MIN_VERSION: i32 = 3_035_000;
/// Reachability probe timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// One validation check result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartupCheck {
    pub name: String,
    pub passed: bool,
    pub fatal: bool,
    pub message: String,
}

/// All check results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartupReport {
    pub checks: Vec<StartupCheck>,
}

impl StartupReport {
    /// True when no fatal check failed.
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed || !c.fatal)
    }

    pub fn failed(&self) -> Vec<&StartupCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let mark = if check.passed {
                "ok  "
            } else if check.fatal {
                "FAIL"
            } else {
                "warn"
            };
            out.push_str(&format!("[{mark}] {}: {}\n", check.name, check.message));
        }
        out
    }

    /// Convert to an error when a fatal check failed.
    pub fn into_result(self) -> Result<StartupReport, StartupError> {
        if self.ok() {
            Ok(self)
        } else {
            let failed = self.failed().len();
            Err(StartupError::ValidationFailed {
                failed,
                total: self.checks.len(),
            })
        }
    }
}

/// Run all startup checks. The provider, when given, is pinged for
/// reachability (a warning, not a failure: the agent runs degraded without
/// its LLM).
pub async fn validate(config: &Config, provider: Option<Arc<dyn LlmProvider>>) -> StartupReport {
    let mut checks = Vec::new();

    checks.push(check_config(config));
    checks.push(check_data_dirs(config));
    checks.push(check_disk_space(config));
    checks.push(check_sqlite_version());
    checks.push(check_embedding_dim(config));
    if config.api.enabled {
        checks.push(check_api_port(config));
    }
    if let Some(provider) = provider {
        checks.push(check_llm_endpoint(provider).await);
    }

    let report = StartupReport { checks };
    for check in report.failed() {
        if check.fatal {
            tracing::error!(check = %check.name, message = %check.message, "startup check failed");
        } else {
            tracing::warn!(check = %check.name, message = %check.message, "startup check warning");
        }
    }
    report
}

fn check(name: &str, fatal: bool, result: Result<String, String>) -> StartupCheck {
    match result {
        Ok(message) => StartupCheck {
            name: name.to_string(),
            passed: true,
            fatal,
            message,
        },
        Err(message) => StartupCheck {
            name: name.to_string(),
            passed: false,
            fatal,
            message,
        },
    }
}

fn check_config(config: &Config) -> StartupCheck {
    check(
        "config",
        true,
        config
            .validate()
            .map(|_| "configuration valid".to_string())
            .map_err(|e| e.to_string()),
    )
}

fn check_data_dirs(config: &Config) -> StartupCheck {
    let result = (|| -> Result<String, String> {
        for dir in [
            config.data_dir.clone(),
            config.memory_dir(),
            config.archive_dir(),
            config.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
            let probe = dir.join(".write_probe");
            std::fs::write(&probe, b"probe")
                .map_err(|e| format!("{} not writable: {e}", dir.display()))?;
            let _ = std::fs::remove_file(&probe);
        }
        Ok(format!("data directories writable under {}", config.data_dir.display()))
    })();
    check("data-dirs", true, result)
}

fn check_disk_space(config: &Config) -> StartupCheck {
    let disks = Disks::new_with_refreshed_list();
    let data_dir = config
        .data_dir
        .canonicalize()
        .unwrap_or_else(|_| config.data_dir.clone());

    // Longest mount-point prefix owns the directory.
    let available = disks
        .iter()
        .filter(|disk| data_dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space());

    let result = match available {
        Some(bytes) if bytes >= DISK_FLOOR_BYTES => {
            Ok(format!("{} MiB free", bytes / (1024 * 1024)))
        }
        Some(bytes) => Err(format!(
            "only {} MiB free, need at least {} MiB",
            bytes / (1024 * 1024),
            DISK_FLOOR_BYTES / (1024 * 1024)
        )),
        None => Ok("could not resolve disk for data directory, skipping".to_string()),
    };
    check("disk-space", true, result)
}

fn check_sqlite_version() -> StartupCheck {
    let version = rusqlite::version_number();
    let result = if version >= SQLITE_MIN_VERSION {
        Ok(format!("sqlite {}", rusqlite::version()))
    } else {
        Err(format!(
            "sqlite {} too old, need at least 3.35",
            rusqlite::version()
        ))
    };
    check("sqlite-version", true, result)
}

fn check_embedding_dim(config: &Config) -> StartupCheck {
    let path = config.vector_db_path();
    let result = if path.exists() {
        match VectorStore::stored_dim(&path) {
            Some(stored) if stored == config.llm.embedding_dim => {
                Ok(format!("vector store dimension {stored} matches"))
            }
            Some(stored) => Err(format!(
                "vector store has dimension {stored}, config says {}",
                config.llm.embedding_dim
            )),
            None => Err("existing vector store has no recorded dimension".to_string()),
        }
    } else {
        Ok(format!(
            "no vector store yet, will create with dimension {}",
            config.llm.embedding_dim
        ))
    };
    check("embedding-dim", true, result)
}

fn check_api_port(config: &Config) -> StartupCheck {
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let result = match TcpListener::bind(&addr) {
        Ok(listener) => {
            drop(listener);
            Ok(format!("{addr} free"))
        }
        Err(e) => Err(format!("cannot bind {addr}: {e}")),
    };
    check("api-port", true, result)
}

async fn check_llm_endpoint(provider: Arc<dyn LlmProvider>) -> StartupCheck {
    let result = match provider.ping(PING_TIMEOUT).await {
        Ok(()) => Ok("llm endpoint reachable".to_string()),
        Err(e) => Err(format!("llm endpoint unreachable: {e}")),
    };
    // Unreachable LLM degrades the agent but must not keep it from starting.
    check("llm-endpoint", false, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderError;
    use async_trait::async_trait;

    struct DeadProvider;

    #[async_trait]
    impl LlmProvider for DeadProvider {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[crate::llm::ChatMessage],
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            Err(ProviderError::Connection("dead".to_string()))
        }

        async fn embed(
            &self,
            _model: &str,
            _input: &str,
            _timeout: Duration,
        ) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Connection("dead".to_string()))
        }

        async fn ping(&self, _timeout: Duration) -> Result<(), ProviderError> {
            Err(ProviderError::Connection("refused".to_string()))
        }
    }

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.api.enabled = false;
        config
    }

    #[tokio::test]
    async fn healthy_environment_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let report = validate(&config, None).await;
        assert!(report.ok(), "{}", report.summary());
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.llm.embedding_dim = 0;
        let report = validate(&config, None).await;
        assert!(!report.ok());
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn unreachable_llm_is_a_warning_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let report = validate(&config, Some(Arc::new(DeadProvider))).await;
        assert!(report.ok(), "{}", report.summary());
        let llm = report
            .checks
            .iter()
            .find(|c| c.name == "llm-endpoint")
            .unwrap();
        assert!(!llm.passed);
        assert!(!llm.fatal);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        std::fs::create_dir_all(config.memory_dir()).unwrap();
        {
            let _store = VectorStore::open(&config.vector_db_path(), 384).unwrap();
        }
        config.llm.embedding_dim = 768;
        let report = validate(&config, None).await;
        assert!(!report.ok());
        let dim = report
            .checks
            .iter()
            .find(|c| c.name == "embedding-dim")
            .unwrap();
        assert!(!dim.passed);
    }

    #[tokio::test]
    async fn occupied_port_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        config.api.enabled = true;
        config.api.port = port;
        let report = validate(&config, None).await;
        let api = report.checks.iter().find(|c| c.name == "api-port").unwrap();
        assert!(!api.passed);
    }

    #[tokio::test]
    async fn summary_lists_every_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let report = validate(&config, None).await;
        let summary = report.summary();
        for check in &report.checks {
            assert!(summary.contains(&check.name));
        }
    }
}
