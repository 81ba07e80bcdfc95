//! Headless LAN-drop daemon: negotiation server plus discovery, with all
//! progress routed into the structured log.

use std::path::PathBuf;
use std::sync::Arc;

use ldrop_app::{ShareService, TokioShareTaskSpawner, default_share_settings};
use protocol::models::{PeerDeviceDto, PrepareUploadRequestDto, SessionSnapshotDto, ShareSettingsDto};
use protocol::{AppError, AppResult};
use server::ShareEventSink;

struct LoggingShareEventSink;

impl ShareEventSink for LoggingShareEventSink {
    fn emit_device_sync(&self, devices: &[PeerDeviceDto]) -> AppResult<()> {
        let online_count = devices.iter().filter(|device| device.is_online).count();
        tracing::info!(
            event = "share_device_sync",
            device_count = devices.len(),
            online_count
        );
        Ok(())
    }

    fn emit_session_sync(&self, snapshot: &SessionSnapshotDto) -> AppResult<()> {
        tracing::info!(
            event = "share_session_sync",
            session_id = snapshot.session_id,
            status = snapshot.status.as_str(),
            transferred_bytes = snapshot.transferred_bytes,
            total_bytes = snapshot.total_bytes
        );
        Ok(())
    }

    fn emit_incoming_request(
        &self,
        session_id: &str,
        request: &PrepareUploadRequestDto,
    ) -> AppResult<()> {
        tracing::info!(
            event = "share_incoming_request",
            session_id = session_id,
            sender = request.info.alias,
            file_count = request.files.len()
        );
        Ok(())
    }
}

fn resolve_data_dir() -> PathBuf {
    if let Some(value) = std::env::var_os("LDROP_DATA_DIR") {
        return PathBuf::from(value);
    }
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".ldrop"))
        .unwrap_or_else(|| std::env::temp_dir().join("ldrop"))
}

fn settings_from_env() -> AppResult<ShareSettingsDto> {
    let mut settings = default_share_settings();
    // no acceptance UI here, so transfers are taken unless a PIN gate is set
    settings.auto_accept = true;

    if let Ok(value) = std::env::var("LDROP_ALIAS") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            settings.device_alias = trimmed.to_string();
        }
    }
    if let Ok(value) = std::env::var("LDROP_PORT") {
        settings.server_port = value.trim().parse().map_err(|_| {
            AppError::new("share_setting_port_invalid", "监听端口不合法")
                .with_context("port", value.clone())
        })?;
    }
    if let Ok(value) = std::env::var("LDROP_DOWNLOAD_DIR") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            settings.download_dir = trimmed.to_string();
        }
    }
    if let Ok(value) = std::env::var("LDROP_PIN") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            settings.require_pin = true;
            settings.pin = trimmed.to_string();
        }
    }
    Ok(settings)
}

async fn run() -> AppResult<()> {
    let data_dir = resolve_data_dir();
    let _logging_guard = infra::logging::init_logging(data_dir.as_path())?;

    let settings = settings_from_env()?;
    let service = ShareService::new(
        Arc::new(LoggingShareEventSink),
        Arc::new(TokioShareTaskSpawner),
        settings,
    );

    service.start_server().await?;
    service.start_discovery().await?;

    let settings = service.get_settings();
    tracing::info!(
        event = "share_daemon_ready",
        alias = settings.device_alias,
        port = settings.server_port,
        connection_key = service.connection_key(),
        download_dir = settings.download_dir
    );

    tokio::signal::ctrl_c().await.map_err(|error| {
        AppError::new("share_signal_failed", "监听退出信号失败").with_cause(error.to_string())
    })?;

    tracing::info!(event = "share_daemon_stopping");
    service.stop_discovery();
    service.stop_server();
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}
