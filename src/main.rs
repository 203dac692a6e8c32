use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, Command};
use tracing_subscriber::EnvFilter;

use anima_runtime::llm::HttpLlmProvider;
use anima_runtime::{validate_startup, AgentRuntime, Config, LlmProvider};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when startup validation fails.
const EXIT_VALIDATION: u8 = 1;
/// Exit code for an unrecoverable crash in the scheduler or runtime.
const EXIT_CRASH: u8 = 2;

fn main() -> ExitCode {
    let matches = Command::new("anima")
        .version(VERSION)
        .about("Anima - autonomous cognitive agent runtime")
        .subcommand(
            Command::new("up")
                .about("Start the agent and run until a signal arrives")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("PATH")
                        .help("Configuration file (YAML)")
                        .default_value("data/config.yaml"),
                )
                .arg(
                    Arg::new("data-dir")
                        .short('d')
                        .long("data-dir")
                        .value_name("PATH")
                        .help("Override the data directory"),
                ),
        )
        .subcommand(
            Command::new("doctor")
                .about("Run the startup checks and print the report")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("PATH")
                        .help("Configuration file (YAML)")
                        .default_value("data/config.yaml"),
                ),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .get_matches();

    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match matches.subcommand() {
        Some(("up", sub)) => {
            let config_path = PathBuf::from(sub.get_one::<String>("config").unwrap());
            let data_dir = sub.get_one::<String>("data-dir").map(PathBuf::from);
            runtime.block_on(run_up(config_path, data_dir))
        }
        Some(("doctor", sub)) => {
            let config_path = PathBuf::from(sub.get_one::<String>("config").unwrap());
            runtime.block_on(run_doctor(config_path))
        }
        _ => unreachable!("subcommand required"),
    }
}

fn init_tracing() {
    let filter = std::env::var(anima_runtime::config::ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn load_config(config_path: &PathBuf, data_dir: Option<PathBuf>) -> Option<Config> {
    match Config::load_or_default(config_path) {
        Ok(mut config) => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            Some(config)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            None
        }
    }
}

async fn run_up(config_path: PathBuf, data_dir: Option<PathBuf>) -> ExitCode {
    let Some(config) = load_config(&config_path, data_dir) else {
        return ExitCode::from(EXIT_VALIDATION);
    };

    let provider: Arc<dyn LlmProvider> = Arc::new(HttpLlmProvider::from_config(&config.llm));

    let report = validate_startup(&config, Some(provider.clone())).await;
    eprint!("{}", report.summary());
    if !report.ok() {
        tracing::error!("startup validation failed");
        return ExitCode::from(EXIT_VALIDATION);
    }

    let runtime = match AgentRuntime::new(config, provider) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble runtime");
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    match runtime.run().await {
        Ok(reason) => {
            let code = reason.exit_code();
            tracing::info!(code, "agent stopped");
            ExitCode::from(code as u8)
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable runtime failure");
            ExitCode::from(EXIT_CRASH)
        }
    }
}

async fn run_doctor(config_path: PathBuf) -> ExitCode {
    let Some(config) = load_config(&config_path, None) else {
        return ExitCode::from(EXIT_VALIDATION);
    };
    let provider: Arc<dyn LlmProvider> = Arc::new(HttpLlmProvider::from_config(&config.llm));
    let report = validate_startup(&config, Some(provider)).await;
    print!("{}", report.summary());
    if report.ok() {
        println!("all checks passed");
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_VALIDATION)
    }
}
