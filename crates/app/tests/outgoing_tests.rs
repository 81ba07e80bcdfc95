//! Sender pipeline driven end-to-end against a real receiver on loopback.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use discovery::DeviceRegistry;
use ldrop_app::{NoopShareEventSink, ShareEventSink, ShareService, TokioShareTaskSpawner};
use protocol::AppResult;
use protocol::models::{
    DeviceKind, DeviceProtocol, PeerDeviceDto, PrepareUploadRequestDto, SessionSnapshotDto,
    SessionStatus, ShareSettingsDto,
};
use server::{PendingAcceptances, ServerContext, SessionRegistry, bind_listener, serve};

struct Receiver {
    port: u16,
    context: Arc<ServerContext>,
    download_dir: PathBuf,
    _shutdown: watch::Sender<bool>,
}

async fn start_receiver(configure: impl FnOnce(&mut ShareSettingsDto)) -> Receiver {
    let download_dir =
        std::env::temp_dir().join(format!("ldrop-outgoing-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&download_dir).expect("create download dir");

    let mut settings = ShareSettingsDto::with_defaults(
        "receiver".to_string(),
        download_dir.to_string_lossy().to_string(),
    );
    settings.auto_accept = true;
    configure(&mut settings);

    let context = Arc::new(ServerContext {
        settings: Arc::new(RwLock::new(settings)),
        devices: Arc::new(DeviceRegistry::new()),
        sessions: Arc::new(SessionRegistry::new()),
        pending: Arc::new(PendingAcceptances::new()),
        event_sink: Arc::new(NoopShareEventSink),
        self_fingerprint: "feedfacecafebeef".to_string(),
    });

    let listener = bind_listener(0).await.expect("bind receiver listener");
    let port = listener.local_addr().expect("listener addr").port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(listener, context.clone(), shutdown_rx));

    Receiver {
        port,
        context,
        download_dir,
        _shutdown: shutdown_tx,
    }
}

fn receiver_device(port: u16) -> PeerDeviceDto {
    PeerDeviceDto {
        fingerprint: "feedfacecafebeef".to_string(),
        alias: "receiver".to_string(),
        device_type: DeviceKind::Desktop,
        device_model: None,
        ip_address: "127.0.0.1".to_string(),
        port,
        protocol: DeviceProtocol::Http,
        version: "2.0".to_string(),
        last_seen: 0,
        is_online: true,
    }
}

struct RecordingSink {
    snapshots: Mutex<Vec<SessionSnapshotDto>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    fn statuses(&self) -> Vec<SessionStatus> {
        self.snapshots
            .lock()
            .expect("sink lock")
            .iter()
            .map(|snapshot| snapshot.status)
            .collect()
    }

    fn last(&self) -> Option<SessionSnapshotDto> {
        self.snapshots.lock().expect("sink lock").last().cloned()
    }
}

impl ShareEventSink for RecordingSink {
    fn emit_device_sync(&self, _devices: &[PeerDeviceDto]) -> AppResult<()> {
        Ok(())
    }

    fn emit_session_sync(&self, snapshot: &SessionSnapshotDto) -> AppResult<()> {
        self.snapshots.lock().expect("sink lock").push(snapshot.clone());
        Ok(())
    }

    fn emit_incoming_request(
        &self,
        _session_id: &str,
        _request: &PrepareUploadRequestDto,
    ) -> AppResult<()> {
        Ok(())
    }
}

fn sender_service(sink: Arc<dyn ShareEventSink>) -> ShareService {
    let settings = ShareSettingsDto::with_defaults(
        "sender-node".to_string(),
        std::env::temp_dir()
            .join("ldrop-sender-downloads")
            .to_string_lossy()
            .to_string(),
    );
    ShareService::new(sink, Arc::new(TokioShareTaskSpawner), settings)
}

fn write_source(dir: &PathBuf, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write source file");
    path
}

async fn wait_for_status(
    receiver: &Receiver,
    session_id: &str,
    status: SessionStatus,
) -> SessionSnapshotDto {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(snapshot) = receiver.context.sessions.snapshot(session_id) {
            if snapshot.status == status {
                return snapshot;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn send_files_should_deliver_multi_chunk_files_end_to_end() {
    let receiver = start_receiver(|_| {}).await;
    let sink = Arc::new(RecordingSink::new());
    let service = sender_service(sink.clone());

    let source_dir =
        std::env::temp_dir().join(format!("ldrop-outgoing-src-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&source_dir).expect("create source dir");
    // larger than one send chunk, so the transfer exercises ranged appends
    let big: Vec<u8> = (0..1_300_000u32).map(|value| (value % 251) as u8).collect();
    let big_path = write_source(&source_dir, "big.bin", big.as_slice());
    let note_path = write_source(&source_dir, "note.txt", b"hello receiver");

    let session_id = service
        .send_files(
            &receiver_device(receiver.port),
            vec![big_path, note_path],
            None,
        )
        .await
        .expect("send files");

    let snapshot = wait_for_status(&receiver, session_id.as_str(), SessionStatus::Completed).await;
    assert_eq!(snapshot.transferred_bytes, snapshot.total_bytes);
    assert!(snapshot.files.iter().all(|file| file.received));

    let delivered_big =
        std::fs::read(receiver.download_dir.join("big.bin")).expect("read delivered big");
    assert_eq!(delivered_big, big);
    let delivered_note =
        std::fs::read(receiver.download_dir.join("note.txt")).expect("read delivered note");
    assert_eq!(delivered_note, b"hello receiver");

    // sender-side progress ends on a completed snapshot
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if sink.statuses().contains(&SessionStatus::Completed) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sender never reported completion"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let last = sink.last().expect("final snapshot");
    assert_eq!(last.session_id, session_id);
    assert_eq!(last.transferred_bytes, last.total_bytes);

    let _ = std::fs::remove_dir_all(source_dir);
    let _ = std::fs::remove_dir_all(&receiver.download_dir);
}

#[tokio::test]
async fn send_files_should_surface_receiver_pin_verdict() {
    let receiver = start_receiver(|settings| {
        settings.require_pin = true;
        settings.pin = "4242".to_string();
    })
    .await;
    let service = sender_service(Arc::new(NoopShareEventSink));

    let source_dir =
        std::env::temp_dir().join(format!("ldrop-outgoing-pin-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&source_dir).expect("create source dir");
    let path = write_source(&source_dir, "guarded.txt", b"guarded payload");

    let error = service
        .send_files(
            &receiver_device(receiver.port),
            vec![path.clone()],
            Some("0000".to_string()),
        )
        .await
        .expect_err("wrong pin");
    assert_eq!(error.code, "share_pin_invalid");
    assert!(receiver.context.sessions.is_empty());

    let session_id = service
        .send_files(
            &receiver_device(receiver.port),
            vec![path],
            Some("4242".to_string()),
        )
        .await
        .expect("correct pin");
    let _ = wait_for_status(&receiver, session_id.as_str(), SessionStatus::Completed).await;

    let delivered =
        std::fs::read(receiver.download_dir.join("guarded.txt")).expect("read delivered");
    assert_eq!(delivered, b"guarded payload");

    let _ = std::fs::remove_dir_all(source_dir);
    let _ = std::fs::remove_dir_all(&receiver.download_dir);
}

#[tokio::test]
async fn send_files_should_deliver_empty_files() {
    let receiver = start_receiver(|_| {}).await;
    let service = sender_service(Arc::new(NoopShareEventSink));

    let source_dir =
        std::env::temp_dir().join(format!("ldrop-outgoing-empty-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&source_dir).expect("create source dir");
    let path = write_source(&source_dir, "empty.bin", b"");

    let session_id = service
        .send_files(&receiver_device(receiver.port), vec![path], None)
        .await
        .expect("send empty file");
    let _ = wait_for_status(&receiver, session_id.as_str(), SessionStatus::Completed).await;

    let delivered = std::fs::read(receiver.download_dir.join("empty.bin")).expect("read delivered");
    assert!(delivered.is_empty());

    let _ = std::fs::remove_dir_all(source_dir);
    let _ = std::fs::remove_dir_all(&receiver.download_dir);
}

#[tokio::test]
async fn send_files_should_fail_fast_when_peer_is_unreachable() {
    let service = sender_service(Arc::new(NoopShareEventSink));

    let source_dir =
        std::env::temp_dir().join(format!("ldrop-outgoing-dead-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&source_dir).expect("create source dir");
    let path = write_source(&source_dir, "orphan.txt", b"nobody listens");

    // port 1 on loopback refuses immediately
    let error = service
        .send_files(&receiver_device(1), vec![path], None)
        .await
        .expect_err("unreachable peer");
    assert_eq!(error.code, "share_prepare_failed");

    let _ = std::fs::remove_dir_all(source_dir);
}

#[tokio::test]
async fn send_files_should_reject_an_empty_manifest() {
    let service = sender_service(Arc::new(NoopShareEventSink));
    let error = service
        .send_files(&receiver_device(1), Vec::new(), None)
        .await
        .expect_err("empty manifest");
    assert_eq!(error.code, "share_manifest_empty");
}
