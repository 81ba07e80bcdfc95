//! `ShareService`: the embedding host's facade over the whole engine.
//!
//! Owns every shared registry and injects them into the HTTP handlers, the
//! discovery loops and the outgoing pipeline. Background work goes through
//! the injected task spawner so hosts without a live runtime fail at spawn
//! time; progress and incoming requests go through the injected event sink.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};

use discovery::announce::{self, DiscoveryEvent};
use discovery::{DeviceRegistry, DiscoveryTransport, manual, scan};
use protocol::keys;
use protocol::models::{
    DeviceAnnouncementDto, DeviceInfoDto, PeerDeviceDto, SenderInfoDto, SessionSnapshotDto,
    ShareSettingsDto, ShareUpdateSettingsInputDto,
};
use protocol::{AppError, AppResult, DISCOVERY_SWEEP_INTERVAL_MS, REGISTER_TIMEOUT_MS, now_millis};
use server::{
    PendingAcceptances, ServerContext, SessionRegistry, ShareEventSink, bind_listener, serve,
};

use crate::task_spawner::{ShareTask, ShareTaskSpawner};

mod outgoing;

const DISCOVERY_EVENT_BUFFER: usize = 64;

fn lock_mutex<'a, T>(lock: &'a Mutex<T>, name: &'static str) -> std::sync::MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "share_lock_poisoned", lock = name, access = "mutex");
            poisoned.into_inner()
        }
    }
}

fn read_lock<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "share_lock_poisoned", lock = name, access = "read");
            poisoned.into_inner()
        }
    }
}

fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "share_lock_poisoned", lock = name, access = "write");
            poisoned.into_inner()
        }
    }
}

fn prune_finished_tasks(tasks: &mut Vec<JoinHandle<()>>) -> usize {
    let previous_len = tasks.len();
    tasks.retain(|task| !task.is_finished());
    previous_len.saturating_sub(tasks.len())
}

/// Handle to a running outgoing transfer, kept so `cancel_session` can stop
/// the worker and tell the receiver.
pub(crate) struct OutgoingControl {
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) device: PeerDeviceDto,
}

#[derive(Clone)]
pub struct ShareService {
    event_sink: Arc<dyn ShareEventSink>,
    task_spawner: Arc<dyn ShareTaskSpawner>,
    client: reqwest::Client,
    self_fingerprint: String,
    settings: Arc<RwLock<ShareSettingsDto>>,
    devices: Arc<DeviceRegistry>,
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingAcceptances>,
    server_started: Arc<AtomicBool>,
    server_shutdown: Arc<Mutex<Option<watch::Sender<bool>>>>,
    discovery_stop: Arc<AtomicBool>,
    discovery_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    outgoing_controls: Arc<RwLock<HashMap<String, OutgoingControl>>>,
}

impl ShareService {
    pub fn new(
        event_sink: Arc<dyn ShareEventSink>,
        task_spawner: Arc<dyn ShareTaskSpawner>,
        settings: ShareSettingsDto,
    ) -> Self {
        let self_fingerprint = keys::derive_fingerprint(host_seed().as_str());

        Self {
            event_sink,
            task_spawner,
            client: reqwest::Client::new(),
            self_fingerprint,
            settings: Arc::new(RwLock::new(settings)),
            devices: Arc::new(DeviceRegistry::new()),
            sessions: Arc::new(SessionRegistry::new()),
            pending: Arc::new(PendingAcceptances::new()),
            server_started: Arc::new(AtomicBool::new(false)),
            server_shutdown: Arc::new(Mutex::new(None)),
            discovery_stop: Arc::new(AtomicBool::new(false)),
            discovery_tasks: Arc::new(Mutex::new(Vec::new())),
            outgoing_controls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn spawn_task<F>(&self, task_name: &'static str, fut: F) -> AppResult<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: ShareTask = Box::pin(fut);
        self.task_spawner.spawn(task_name, task)
    }

    pub fn fingerprint(&self) -> &str {
        self.self_fingerprint.as_str()
    }

    /// Human-shareable pairing key for this node.
    pub fn connection_key(&self) -> String {
        keys::connection_key(self.self_fingerprint.as_str())
    }

    pub fn get_settings(&self) -> ShareSettingsDto {
        read_lock(self.settings.as_ref(), "settings").clone()
    }

    /// Partial update with clamped windows. The server and discovery loops
    /// read settings when they start; port and interval changes apply on the
    /// next start.
    pub fn update_settings(
        &self,
        input: ShareUpdateSettingsInputDto,
    ) -> AppResult<ShareSettingsDto> {
        let mut next = self.get_settings();

        if let Some(value) = input.device_alias {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::new("share_setting_alias_invalid", "设备名称不能为空"));
            }
            next.device_alias = trimmed.to_string();
        }
        if let Some(value) = input.server_port {
            if value == 0 {
                return Err(AppError::new("share_setting_port_invalid", "监听端口不合法"));
            }
            next.server_port = value;
        }
        if let Some(value) = input.download_dir {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::new(
                    "share_setting_download_dir_invalid",
                    "下载目录不能为空",
                ));
            }
            next.download_dir = trimmed.to_string();
        }
        if let Some(value) = input.require_pin {
            next.require_pin = value;
        }
        if let Some(value) = input.pin {
            next.pin = value.trim().to_string();
        }
        if next.require_pin && next.pin.is_empty() {
            return Err(AppError::new("share_setting_pin_empty", "启用 PIN 时必须设置 PIN"));
        }
        if let Some(value) = input.auto_accept {
            next.auto_accept = value;
        }
        if let Some(value) = input.discovery_enabled {
            next.discovery_enabled = value;
        }
        if let Some(value) = input.announcement_interval_ms {
            next.announcement_interval_ms = value.clamp(1_000, 60_000);
        }
        if let Some(value) = input.device_timeout_ms {
            next.device_timeout_ms = value.clamp(5_000, 600_000);
        }
        if let Some(value) = input.accept_timeout_ms {
            next.accept_timeout_ms = value.clamp(5_000, 600_000);
        }
        if let Some(value) = input.session_retention_ms {
            next.session_retention_ms = value.clamp(10_000, 86_400_000);
        }

        *write_lock(self.settings.as_ref(), "settings") = next.clone();
        Ok(next)
    }

    pub fn self_description(&self) -> DeviceInfoDto {
        let settings = self.get_settings();
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

    pub(crate) fn sender_info(&self) -> SenderInfoDto {
        let settings = self.get_settings();
        SenderInfoDto {
            alias: settings.device_alias,
            version: protocol::PROTOCOL_VERSION.to_string(),
            device_model: settings.device_model,
            device_type: settings.device_type,
            fingerprint: self.self_fingerprint.clone(),
        }
    }

    fn announcement(&self, settings: &ShareSettingsDto) -> DeviceAnnouncementDto {
        DeviceAnnouncementDto {
            alias: settings.device_alias.clone(),
            version: protocol::PROTOCOL_VERSION.to_string(),
            device_model: settings.device_model.clone(),
            device_type: settings.device_type,
            fingerprint: self.self_fingerprint.clone(),
            port: settings.server_port,
            protocol: settings.protocol,
            download: None,
            announce: true,
        }
    }

    /// Binds and runs the negotiation listener. Idempotent; bind failures
    /// surface to the caller and leave the service stoppable/restartable.
    pub async fn start_server(&self) -> AppResult<()> {
        if self.server_started.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let port = self.get_settings().server_port;
        let listener = match bind_listener(port).await {
            Ok(value) => value,
            Err(error) => {
                self.server_started.store(false, Ordering::Relaxed);
                return Err(error);
            }
        };

        let context = Arc::new(ServerContext {
            settings: self.settings.clone(),
            devices: self.devices.clone(),
            sessions: self.sessions.clone(),
            pending: self.pending.clone(),
            event_sink: self.event_sink.clone(),
            self_fingerprint: self.self_fingerprint.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Err(error) = self.spawn_task("share_server", async move {
            serve(listener, context, shutdown_rx).await;
        }) {
            self.server_started.store(false, Ordering::Relaxed);
            return Err(error);
        }

        *lock_mutex(self.server_shutdown.as_ref(), "server_shutdown") = Some(shutdown_tx);
        tracing::info!(event = "share_server_started", port);
        Ok(())
    }

    /// Safe to call when never started.
    pub fn stop_server(&self) {
        if !self.server_started.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(shutdown) = lock_mutex(self.server_shutdown.as_ref(), "server_shutdown").take()
        {
            let _ = shutdown.send(true);
        }
        tracing::info!(event = "share_server_stopped");
    }

    /// Starts the announcement transport, the event consumer and the periodic
    /// sweeps. Hosts that cannot open a multicast socket fall back to the
    /// register-probe scan transport instead of failing.
    pub async fn start_discovery(&self) -> AppResult<()> {
        let settings = self.get_settings();
        if !settings.discovery_enabled {
            return Ok(());
        }

        {
            let mut tasks = lock_mutex(self.discovery_tasks.as_ref(), "discovery_tasks");
            let pruned = prune_finished_tasks(&mut tasks);
            if pruned > 0 {
                tracing::warn!(event = "share_discovery_task_pruned", pruned_count = pruned);
            }
            if !tasks.is_empty() {
                return Ok(());
            }
        }

        self.discovery_stop.store(false, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(DISCOVERY_EVENT_BUFFER);
        let mut spawned = Vec::new();
        match self
            .spawn_discovery_tasks(&settings, events_tx, events_rx, &mut spawned)
            .await
        {
            Ok(transport) => {
                let mut tasks = lock_mutex(self.discovery_tasks.as_ref(), "discovery_tasks");
                if !tasks.is_empty() {
                    // lost a concurrent start race; the first set wins
                    for task in spawned {
                        task.abort();
                    }
                    return Ok(());
                }
                tasks.extend(spawned);
                tracing::info!(event = "share_discovery_started", transport = transport.as_str());
                Ok(())
            }
            Err(error) => {
                self.discovery_stop.store(true, Ordering::Relaxed);
                for task in spawned {
                    task.abort();
                }
                Err(error)
            }
        }
    }

    async fn spawn_discovery_tasks(
        &self,
        settings: &ShareSettingsDto,
        events_tx: mpsc::Sender<DiscoveryEvent>,
        events_rx: mpsc::Receiver<DiscoveryEvent>,
        spawned: &mut Vec<JoinHandle<()>>,
    ) -> AppResult<DiscoveryTransport> {
        let self_description = self.self_description();

        let transport = match announce::bind_beacon_socket().await {
            Ok(socket) => {
                let stop = self.discovery_stop.clone();
                let announcement = self.announcement(settings);
                let interval_ms = settings.announcement_interval_ms;
                spawned.push(self.spawn_task("share_discovery_announce", async move {
                    announce::run_announce_loop(stop, announcement, interval_ms).await;
                })?);

                let stop = self.discovery_stop.clone();
                let fingerprint = self.self_fingerprint.clone();
                let description = self_description.clone();
                let client = self.client.clone();
                let beacon_tx = events_tx.clone();
                spawned.push(self.spawn_task("share_discovery_listen", async move {
                    announce::run_beacon_listen_loop(
                        stop,
                        socket,
                        fingerprint,
                        description,
                        client,
                        beacon_tx,
                    )
                    .await;
                })?);
                DiscoveryTransport::Multicast
            }
            Err(error) => {
                tracing::warn!(
                    event = "share_multicast_unavailable",
                    error_code = error.code,
                    fallback = DiscoveryTransport::HttpScan.as_str()
                );

                let stop = self.discovery_stop.clone();
                let description = self_description.clone();
                let client = self.client.clone();
                let scan_tx = events_tx.clone();
                let rescan_ms = settings.device_timeout_ms.max(5_000) as u64;
                spawned.push(self.spawn_task("share_discovery_scan", async move {
                    loop {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        scan::run_http_scan(
                            stop.clone(),
                            client.clone(),
                            description.clone(),
                            scan_tx.clone(),
                        )
                        .await;
                        sleep(Duration::from_millis(rescan_ms)).await;
                    }
                })?);
                DiscoveryTransport::HttpScan
            }
        };
        drop(events_tx);

        let devices = self.devices.clone();
        let event_sink = self.event_sink.clone();
        spawned.push(self.spawn_task("share_discovery_events", async move {
            let mut events_rx = events_rx;
            while let Some(event) = events_rx.recv().await {
                let DiscoveryEvent::PeerSeen(peer) = event;
                tracing::debug!(
                    event = "share_peer_seen",
                    alias = peer.alias,
                    address = peer.ip_address
                );
                devices.upsert(peer, now_millis());
                if let Err(error) = event_sink.emit_device_sync(devices.list().as_slice()) {
                    tracing::warn!(
                        event = "share_event_emit_failed",
                        event_name = "share_device_sync",
                        error_code = error.code
                    );
                }
            }
        })?);

        let service = self.clone();
        let stop = self.discovery_stop.clone();
        spawned.push(self.spawn_task("share_discovery_sweep", async move {
            let mut ticker = interval(Duration::from_millis(DISCOVERY_SWEEP_INTERVAL_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                service.run_sweep_pass();
                ticker.tick().await;
            }
        })?);

        Ok(transport)
    }

    fn run_sweep_pass(&self) {
        let settings = self.get_settings();
        let now = now_millis();

        let marked = self.devices.sweep_timeouts(now, settings.device_timeout_ms);
        if marked > 0 {
            tracing::info!(event = "share_device_timeout_swept", marked_count = marked);
            self.emit_device_sync();
        }

        let removed = self.sessions.sweep_terminal(now, settings.session_retention_ms);
        if removed > 0 {
            tracing::info!(event = "share_session_retention_swept", removed_count = removed);
        }
    }

    /// Stops the transports and both sweeps together. Safe to call when
    /// never started.
    pub fn stop_discovery(&self) {
        self.discovery_stop.store(true, Ordering::Relaxed);
        let mut tasks = lock_mutex(self.discovery_tasks.as_ref(), "discovery_tasks");
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!(event = "share_discovery_stopped");
    }

    /// Snapshot of every known peer in insertion order, offline history
    /// included.
    pub fn list_devices(&self) -> Vec<PeerDeviceDto> {
        self.devices.list()
    }

    /// Time-boxed probe of a literal address. Timeout and refusal are both
    /// `None`; a found peer lands in the registry.
    pub async fn connect_by_ip(&self, ip: &str) -> Option<PeerDeviceDto> {
        let peer = manual::connect_by_ip(&self.client, ip, &self.self_description()).await?;
        tracing::info!(
            event = "share_manual_connect",
            alias = peer.alias,
            address = peer.ip_address
        );
        self.devices.upsert(peer.clone(), now_millis());
        self.emit_device_sync();
        Some(peer)
    }

    /// Connection-key lookup over already-discovered peers; no network scan.
    pub fn connect_by_key(&self, key: &str) -> Option<PeerDeviceDto> {
        manual::connect_by_key(self.devices.as_ref(), key)
    }

    /// Resolves a pending incoming request. Returns false when nothing was
    /// pending: the decision already landed or the window elapsed.
    pub fn accept_transfer(&self, session_id: &str) -> bool {
        self.pending.resolve(session_id, true)
    }

    pub fn reject_transfer(&self, session_id: &str) -> bool {
        self.pending.resolve(session_id, false)
    }

    /// Idempotent abort covering both directions: a pending acceptance reads
    /// as rejection, a local session diverts to cancelled, a running outgoing
    /// worker is flagged and the receiver told best-effort.
    pub async fn cancel_session(&self, session_id: &str) {
        self.pending.resolve(session_id, false);
        if self.sessions.cancel(session_id, now_millis()).is_some() {
            tracing::info!(event = "share_session_cancel_requested", session_id = session_id);
            if let Some(snapshot) = self.sessions.snapshot(session_id) {
                self.emit_session_snapshot(&snapshot);
            }
        }

        let control = write_lock(self.outgoing_controls.as_ref(), "outgoing_controls")
            .remove(session_id)
            .map(|control| {
                control.cancelled.store(true, Ordering::Relaxed);
                control.device
            });
        if let Some(device) = control {
            self.send_remote_cancel(&device, session_id).await;
        }
    }

    pub(crate) async fn send_remote_cancel(&self, device: &PeerDeviceDto, session_id: &str) {
        let url = format!(
            "{}://{}:{}/api/localsend/v2/cancel?sessionId={session_id}",
            device.protocol.as_str(),
            device.ip_address,
            device.port
        );
        let result = self
            .client
            .post(url.as_str())
            .timeout(Duration::from_millis(REGISTER_TIMEOUT_MS))
            .send()
            .await;
        if let Err(error) = result {
            tracing::debug!(
                event = "share_remote_cancel_failed",
                url,
                error = error.to_string()
            );
        }
    }

    fn emit_device_sync(&self) {
        if let Err(error) = self.event_sink.emit_device_sync(self.devices.list().as_slice()) {
            tracing::warn!(
                event = "share_event_emit_failed",
                event_name = "share_device_sync",
                error_code = error.code
            );
        }
    }

    fn emit_session_snapshot(&self, snapshot: &SessionSnapshotDto) {
        if let Err(error) = self.event_sink.emit_session_sync(snapshot) {
            tracing::warn!(
                event = "share_event_emit_failed",
                event_name = "share_session_sync",
                error_code = error.code
            );
        }
    }
}

/// Defaults for an embedding host: hostname alias, `~/Downloads` target.
pub fn default_share_settings() -> ShareSettingsDto {
    ShareSettingsDto::with_defaults(resolve_device_alias(), resolve_download_dir())
}

fn resolve_device_alias() -> String {
    for key in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    "ldrop-device".to_string()
}

fn resolve_download_dir() -> String {
    let base = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .map(|home| home.join("Downloads"))
        .unwrap_or_else(|| std::env::temp_dir().join("ldrop-downloads"));
    base.to_string_lossy().to_string()
}

/// Stable per-host seed for the fingerprint. The fingerprint must survive
/// restarts so peers and connection keys stay valid.
fn host_seed() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    format!("{}:{user}", resolve_device_alias())
}
