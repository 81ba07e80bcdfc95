use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::sync::watch;

use discovery::DeviceRegistry;
use protocol::models::{DeviceInfoDto, ShareSettingsDto};
use protocol::{AppError, AppResult};

use crate::event_sink::ShareEventSink;
use crate::pending::PendingAcceptances;
use crate::routes;
use crate::sessions::SessionRegistry;

/// Shared state injected into every negotiation handler. Owned by the
/// embedding service, never global.
pub struct ServerContext {
    pub settings: Arc<RwLock<ShareSettingsDto>>,
    pub devices: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingAcceptances>,
    pub event_sink: Arc<dyn ShareEventSink>,
    pub self_fingerprint: String,
}

impl ServerContext {
    pub fn settings_snapshot(&self) -> ShareSettingsDto {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                tracing::warn!(event = "share_lock_poisoned", lock = "settings", access = "read");
                poisoned.into_inner().clone()
            }
        }
    }

    pub fn self_description(&self) -> DeviceInfoDto {
        let settings = self.settings_snapshot();
        DeviceInfoDto {
            alias: settings.device_alias,
            version: protocol::PROTOCOL_VERSION.to_string(),
            device_model: settings.device_model,
            device_type: settings.device_type,
            fingerprint: self.self_fingerprint.clone(),
            port: settings.server_port,
            protocol: settings.protocol,
            download: false,
        }
    }
}

pub async fn bind_listener(port: u16) -> AppResult<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|error| {
        AppError::new("share_server_bind_failed", "传输服务绑定端口失败")
            .with_context("port", port.to_string())
            .with_cause(error.to_string())
    })
}

/// Runs the negotiation listener until the shutdown flag flips. The listener
/// is bound by the caller so bind failures surface before any task spawns.
pub async fn serve(
    listener: TcpListener,
    context: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let router = routes::build_router(context);
    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    })
    .await;

    if let Err(error) = result {
        tracing::error!(event = "share_server_terminated", error = error.to_string());
    }
}
