pub mod classification;
pub mod companion;
pub mod config_store;
pub mod errors;
pub mod history;
pub mod log_monitor;
pub mod models;
pub mod notify;
pub mod policy;
pub mod process_tracker;
pub mod runner;
pub mod scheduler;
pub mod silence;
pub mod worker_config;

pub use crate::classification::WorkerRules;
pub use crate::config_store::{ConfigDocument, ConfigStore, ProfileSet, ScriptConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{ProgressEvent, RunMode, RunOutcome, RunReport, RunStatistics};
pub use crate::notify::{ChannelNotifier, Notifier, ProgressSink, TracingNotifier};
pub use crate::runner::{RunContext, RunRequest, RunStateMachine, RunTiming};
pub use crate::scheduler::{Orchestrator, RunCompletion};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global JSON subscriber writing daily files under `<app_data_dir>/logs`.
pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "runner.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
