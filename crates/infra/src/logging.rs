use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use protocol::{AppError, AppResult, ResultExt};

const DEFAULT_LOG_FILTER: &str = "info";

/// Keeps the non-blocking writer alive; dropping it flushes and stops the
/// background log thread.
pub struct LoggingGuard {
    pub log_dir: PathBuf,
    _worker_guard: WorkerGuard,
}

pub fn init_logging(app_data_dir: &Path) -> AppResult<LoggingGuard> {
    let log_dir = app_data_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .with_code("log_dir_create_failed", "创建日志目录失败")
        .with_ctx("logDir", log_dir.display().to_string())?;

    let file_appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("ldrop")
        .filename_suffix("log")
        .build(&log_dir)
        .with_code("log_appender_create_failed", "创建日志写入器失败")
        .with_ctx("logDir", log_dir.display().to_string())?;
    let (file_writer, worker_guard) = tracing_appender::non_blocking(file_appender);

    if !tracing::dispatcher::has_been_set() {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(file_writer)
            .with_current_span(false)
            .with_span_list(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);
        #[cfg(debug_assertions)]
        let subscriber = subscriber.with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(true),
        );

        subscriber
            .try_init()
            .map_err(|error| {
                AppError::new("log_subscriber_init_failed", "初始化日志订阅器失败")
                    .with_cause(error.to_string())
            })?;
    }

    Ok(LoggingGuard {
        log_dir,
        _worker_guard: worker_guard,
    })
}
