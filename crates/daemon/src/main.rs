mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use api::ratelimit::RateLimitConfig;
use api::RouterBuilder;
use auth::AuthConfig;
use storage_sqlite::SqliteBackend;

use crate::config::Config;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "traceway", about = "Self-hosted observability backend for LLM application traces")]
struct Args {
    /// HTTP bind address
    #[arg(long)]
    addr: Option<String>,

    /// Path to SQLite database file
    #[arg(long)]
    db_path: Option<String>,

    /// Comma-separated CORS origins, `*` for permissive
    #[arg(long)]
    cors_origins: Option<String>,

    /// Requests per window per client IP
    #[arg(long)]
    rate_limit_rpm: Option<u32>,

    /// Rate limit window length in seconds
    #[arg(long)]
    rate_limit_window_secs: Option<u64>,

    /// Require a valid API key on every request
    #[arg(long)]
    api_key_required: Option<bool>,

    /// Comma-separated CSV of valid full API keys (`project-<id>`)
    #[arg(long)]
    api_keys: Option<String>,

    /// Key assumed when `--api-key-required=false`
    #[arg(long)]
    default_project_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for daily-rolling log files
    #[arg(long)]
    log_dir: Option<String>,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,
}

/// Resolved configuration merging CLI args over environment variables over
/// the config file over built-in defaults.
struct ResolvedConfig {
    addr: String,
    db_path: PathBuf,
    cors_origins: Vec<String>,
    rate_limit_rpm: u32,
    rate_limit_window_secs: u64,
    api_key_required: bool,
    api_keys: Vec<String>,
    default_project_key: String,
    log_level: String,
    log_dir: PathBuf,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

impl ResolvedConfig {
    fn from_args_and_config(args: &Args, config: &Config) -> Self {
        Self {
            addr: args
                .addr
                .clone()
                .or_else(|| env_string("TRACEWAY_ADDR"))
                .unwrap_or_else(|| config.api.addr.clone()),
            db_path: args
                .db_path
                .clone()
                .or_else(|| env_string("TRACEWAY_DB_PATH"))
                .map(PathBuf::from)
                .unwrap_or_else(|| config.db_path()),
            cors_origins: args
                .cors_origins
                .clone()
                .or_else(|| env_string("CORS_ORIGINS"))
                .map(|csv| csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|| config.api.cors_origins.clone()),
            rate_limit_rpm: args
                .rate_limit_rpm
                .or_else(|| env_parsed("RATE_LIMIT_RPM"))
                .unwrap_or(config.api.rate_limit_rpm),
            rate_limit_window_secs: args
                .rate_limit_window_secs
                .or_else(|| env_parsed("RATE_LIMIT_WINDOW_SECS"))
                .unwrap_or(config.api.rate_limit_window_secs),
            api_key_required: args
                .api_key_required
                .or_else(|| env_bool("API_KEY_REQUIRED"))
                .unwrap_or(config.auth.required),
            api_keys: args
                .api_keys
                .clone()
                .or_else(|| env_string("API_KEYS"))
                .map(|csv| csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|| config.auth.api_keys.clone()),
            default_project_key: args
                .default_project_key
                .clone()
                .or_else(|| env_string("DEFAULT_PROJECT_KEY"))
                .unwrap_or_else(|| config.auth.default_project_key.clone()),
            log_level: args
                .log_level
                .clone()
                .or_else(|| env_string("TRACEWAY_LOG_LEVEL"))
                .unwrap_or_else(|| config.logging.level.clone()),
            log_dir: args
                .log_dir
                .clone()
                .or_else(|| env_string("TRACEWAY_LOG_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| config.log_dir()),
        }
    }
}

fn setup_logging(log_level: &str, log_dir: &std::path::Path) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "traceway.log");

    let stdout_layer = fmt::layer().with_target(false).with_thread_ids(false);
    let file_layer = fmt::layer().json().with_writer(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

/// Periodically sweeps TTL-expired traces/spans, recording the sweep time on
/// `last_sweep` so `/health` can report it. Runs until `shutdown` fires.
async fn run_sweep_loop(
    backend: Arc<dyn storage::StorageBackend>,
    last_sweep: Arc<tokio::sync::RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => {
                info!("ttl sweep loop shutting down");
                return;
            }
        }

        match backend.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "swept expired records");
                }
                *last_sweep.write().await = Some(chrono::Utc::now());
            }
            Err(e) => warn!(error = %e, "ttl sweep failed"),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(std::path::Path::new(path)),
        None => Config::load(),
    };

    let resolved = ResolvedConfig::from_args_and_config(&args, &config);

    setup_logging(&resolved.log_level, &resolved.log_dir);
    info!("traceway starting");

    info!(path = %resolved.db_path.display(), "opening database");
    if let Some(parent) = resolved.db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let backend: Arc<dyn storage::StorageBackend> = match SqliteBackend::open(&resolved.db_path) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!("failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    info!("storage ready");

    let auth_config = AuthConfig::new(
        resolved.api_key_required,
        resolved.api_keys.clone(),
        resolved.default_project_key.clone(),
    );

    let builder = RouterBuilder::new(backend.clone(), auth_config)
        .rate_limit(RateLimitConfig {
            max_requests: resolved.rate_limit_rpm,
            window: Duration::from_secs(resolved.rate_limit_window_secs),
        })
        .cors_origins(resolved.cors_origins.clone());
    let last_sweep = builder.last_sweep_handle();
    let router = builder.build();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweep_handle = tokio::spawn(run_sweep_loop(backend.clone(), last_sweep, shutdown_rx.clone()));

    info!(addr = %resolved.addr, "daemon ready");

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.ok();
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(true);
    };

    if let Err(e) = api::serve_with_shutdown(router, &resolved.addr, shutdown_signal).await {
        error!("api server error: {}", e);
    }

    let _ = sweep_handle.await;
    info!("daemon stopped");
}
