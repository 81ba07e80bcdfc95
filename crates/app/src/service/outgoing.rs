//! Outgoing sender pipeline.
//!
//! Four-step client flow: build the manifest, POST prepare-upload, push each
//! file as ranged chunk writes against the receiver's upload endpoint, cancel
//! best-effort on failure. Chunks ride the same append-only invariant the
//! receiver enforces, so a retried send probes the settled size and continues
//! from there instead of rewriting delivered bytes.

use std::io::SeekFrom;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use infra::receipt;
use protocol::AppErrorPayload;
use protocol::models::{
    FileMetadataDto, PrepareUploadRequestDto, PrepareUploadResponseDto, ResumeProbeDto,
    SessionFileSnapshotDto, SessionStatus,
};

use super::*;

const SEND_CHUNK_BYTES: usize = 512 * 1024;
const SEND_EMIT_INTERVAL_MS: u64 = 200;
const MAX_RANGE_RETRY: usize = 3;
const SEND_CANCELLED_CODE: &str = "share_send_cancelled";

#[derive(Debug, Clone)]
struct OutgoingFilePlan {
    file_id: String,
    token: String,
    source_path: PathBuf,
    metadata: FileMetadataDto,
}

/// Surfaces the receiver's own error code when its body carries one.
async fn remote_error(response: reqwest::Response, status: reqwest::StatusCode) -> AppError {
    if let Ok(payload) = response.json::<AppErrorPayload>().await {
        if !payload.code.trim().is_empty() {
            return AppError::new(payload.code, payload.message)
                .with_context("httpStatus", status.as_u16().to_string());
        }
    }

    let code = if status == reqwest::StatusCode::FORBIDDEN {
        "share_transfer_rejected"
    } else {
        "share_upload_failed"
    };
    AppError::new(code, "对方拒绝或无法处理请求")
        .with_context("httpStatus", status.as_u16().to_string())
}

/// Coarse media type for the manifest; receivers treat it as advisory.
fn file_type_for(file_name: &str) -> String {
    let extension = file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let file_type = match extension.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    };
    file_type.to_string()
}

impl ShareService {
    /// Negotiates a session with `device` and ships `paths` on a background
    /// worker. Returns the receiver-issued session id; progress arrives
    /// through the event sink. The call itself blocks only for manifest
    /// hashing and the prepare-upload round trip (which the receiver may hold
    /// open for its whole acceptance window).
    pub async fn send_files(
        &self,
        device: &PeerDeviceDto,
        paths: Vec<PathBuf>,
        pin: Option<String>,
    ) -> AppResult<String> {
        if paths.is_empty() {
            return Err(AppError::new("share_manifest_empty", "传输清单不能为空"));
        }

        let mut manifest = HashMap::with_capacity(paths.len());
        let mut sources = HashMap::with_capacity(paths.len());
        for path in paths {
            let metadata = tokio::fs::metadata(path.as_path()).await.map_err(|error| {
                AppError::new("share_source_stat_failed", "读取待发送文件失败")
                    .with_context("path", path.to_string_lossy().to_string())
                    .with_cause(error.to_string())
            })?;
            if !metadata.is_file() {
                return Err(AppError::new("share_source_not_file", "仅支持发送文件")
                    .with_context("path", path.to_string_lossy().to_string()));
            }

            let file_name = path
                .file_name()
                .map(|value| value.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let digest = {
                let digest_path = path.clone();
                tokio::task::spawn_blocking(move || receipt::file_sha256_hex(&digest_path))
                    .await
                    .map_err(|error| {
                        AppError::new("share_checksum_failed", "校验和计算失败")
                            .with_cause(error.to_string())
                    })??
            };

            let file_id = uuid::Uuid::new_v4().to_string();
            manifest.insert(
                file_id.clone(),
                FileMetadataDto {
                    id: file_id.clone(),
                    file_name: file_name.clone(),
                    size: metadata.len(),
                    file_type: file_type_for(file_name.as_str()),
                    sha256: Some(digest),
                    preview: None,
                },
            );
            sources.insert(file_id, path);
        }

        let request = PrepareUploadRequestDto {
            info: self.sender_info(),
            files: manifest.clone(),
        };
        let prepared = self.prepare_upload(device, &request, pin).await?;

        let mut plans = Vec::with_capacity(manifest.len());
        for (file_id, metadata) in manifest {
            let token = prepared.files.get(file_id.as_str()).cloned().ok_or_else(|| {
                AppError::new("share_token_missing", "对方未签发文件令牌")
                    .with_context("fileId", file_id.clone())
            })?;
            let source_path = sources.remove(file_id.as_str()).unwrap_or_default();
            plans.push(OutgoingFilePlan {
                file_id,
                token,
                source_path,
                metadata,
            });
        }
        plans.sort_by(|left, right| left.metadata.file_name.cmp(&right.metadata.file_name));

        let session_id = prepared.session_id;
        let cancelled = Arc::new(AtomicBool::new(false));
        write_lock(self.outgoing_controls.as_ref(), "outgoing_controls").insert(
            session_id.clone(),
            OutgoingControl {
                cancelled: cancelled.clone(),
                device: device.clone(),
            },
        );

        let service = self.clone();
        let worker_device = device.clone();
        let worker_session = session_id.clone();
        let spawn_result = self.spawn_task("share_outgoing_worker", async move {
            service
                .run_outgoing_worker(worker_session, worker_device, plans, cancelled)
                .await;
        });
        if let Err(error) = spawn_result {
            write_lock(self.outgoing_controls.as_ref(), "outgoing_controls").remove(&session_id);
            // leave the receiver a cancel so its session does not idle until GC
            self.send_remote_cancel(device, session_id.as_str()).await;
            return Err(error);
        }

        tracing::info!(
            event = "share_send_started",
            session_id = session_id,
            peer = device.alias
        );
        Ok(session_id)
    }

    async fn prepare_upload(
        &self,
        device: &PeerDeviceDto,
        request: &PrepareUploadRequestDto,
        pin: Option<String>,
    ) -> AppResult<PrepareUploadResponseDto> {
        let url = format!(
            "{}://{}:{}/api/localsend/v2/prepare-upload",
            device.protocol.as_str(),
            device.ip_address,
            device.port
        );
        let mut builder = self.client.post(url.as_str()).json(request);
        if let Some(pin) = pin.filter(|value| !value.is_empty()) {
            builder = builder.query(&[("pin", pin)]);
        }

        // no request timeout: the receiver holds the response open until the
        // user decides or its acceptance window elapses
        let response = builder.send().await.map_err(|error| {
            AppError::new("share_prepare_failed", "连接对方设备失败")
                .with_context("url", url.clone())
                .with_cause(error.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(remote_error(response, status).await);
        }
        response
            .json::<PrepareUploadResponseDto>()
            .await
            .map_err(|error| {
                AppError::new("share_prepare_failed", "解析对方响应失败")
                    .with_cause(error.to_string())
            })
    }

    async fn run_outgoing_worker(
        self,
        session_id: String,
        device: PeerDeviceDto,
        plans: Vec<OutgoingFilePlan>,
        cancelled: Arc<AtomicBool>,
    ) {
        let settings = self.get_settings();
        let mut snapshot = SessionSnapshotDto {
            session_id: session_id.clone(),
            sender_fingerprint: self.self_fingerprint.clone(),
            sender_alias: settings.device_alias,
            status: SessionStatus::Accepted,
            total_bytes: plans.iter().map(|plan| plan.metadata.size).sum(),
            transferred_bytes: 0,
            created_at: now_millis(),
            files: plans
                .iter()
                .map(|plan| SessionFileSnapshotDto {
                    id: plan.file_id.clone(),
                    file_name: plan.metadata.file_name.clone(),
                    size: plan.metadata.size,
                    received: false,
                })
                .collect(),
        };
        self.emit_session_snapshot(&snapshot);

        let result = self
            .drive_outgoing(
                session_id.as_str(),
                &device,
                plans.as_slice(),
                cancelled.as_ref(),
                &mut snapshot,
            )
            .await;
        write_lock(self.outgoing_controls.as_ref(), "outgoing_controls").remove(&session_id);

        match result {
            Ok(()) => {
                snapshot.status = SessionStatus::Completed;
                self.emit_session_snapshot(&snapshot);
                tracing::info!(event = "share_send_completed", session_id = session_id);
            }
            Err(error) if error.code == SEND_CANCELLED_CODE => {
                snapshot.status = SessionStatus::Cancelled;
                self.emit_session_snapshot(&snapshot);
                tracing::info!(event = "share_send_cancelled", session_id = session_id);
            }
            Err(error) => {
                snapshot.status = SessionStatus::Cancelled;
                self.emit_session_snapshot(&snapshot);
                self.send_remote_cancel(&device, session_id.as_str()).await;
                tracing::warn!(
                    event = "share_send_failed",
                    session_id = session_id,
                    error_code = error.code,
                    error_detail = error.causes.first().map(String::as_str).unwrap_or_default()
                );
            }
        }
    }

    async fn drive_outgoing(
        &self,
        session_id: &str,
        device: &PeerDeviceDto,
        plans: &[OutgoingFilePlan],
        cancelled: &AtomicBool,
        snapshot: &mut SessionSnapshotDto,
    ) -> AppResult<()> {
        let mut last_emit = Instant::now();
        for (index, plan) in plans.iter().enumerate() {
            self.upload_file(session_id, device, plan, cancelled, snapshot, &mut last_emit)
                .await?;
            snapshot.files[index].received = true;
            self.emit_session_snapshot(snapshot);
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        session_id: &str,
        device: &PeerDeviceDto,
        plan: &OutgoingFilePlan,
        cancelled: &AtomicBool,
        snapshot: &mut SessionSnapshotDto,
        last_emit: &mut Instant,
    ) -> AppResult<()> {
        let url = format!(
            "{}://{}:{}/api/localsend/v2/upload?sessionId={}&fileId={}&token={}",
            device.protocol.as_str(),
            device.ip_address,
            device.port,
            session_id,
            plan.file_id,
            plan.token
        );
        let declared = plan.metadata.size;
        let base = snapshot.transferred_bytes;

        // fresh sends and retried sends share one path: ask the receiver
        // where this file stands and continue from there
        let mut offset = self.probe_remote_size(url.as_str()).await?.min(declared);
        snapshot.transferred_bytes = base + offset;

        // zero-length files still need one write so the receiver can settle
        // the slot
        if declared == 0 {
            return self.post_chunk(url.as_str(), 0, Vec::new()).await;
        }

        let mut file = tokio::fs::File::open(plan.source_path.as_path())
            .await
            .map_err(|error| {
                AppError::new("share_source_open_failed", "打开待发送文件失败")
                    .with_context("path", plan.source_path.to_string_lossy().to_string())
                    .with_cause(error.to_string())
            })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(|error| {
                AppError::new("share_source_seek_failed", "定位待发送文件失败")
                    .with_cause(error.to_string())
            })?;
        }

        let mut buffer = vec![0u8; SEND_CHUNK_BYTES];
        let mut range_retries = 0usize;
        while offset < declared {
            if cancelled.load(Ordering::Relaxed) {
                return Err(AppError::new(SEND_CANCELLED_CODE, "传输已取消")
                    .with_context("sessionId", session_id.to_string()));
            }

            let count = file.read(buffer.as_mut_slice()).await.map_err(|error| {
                AppError::new("share_source_read_failed", "读取待发送文件失败")
                    .with_context("path", plan.source_path.to_string_lossy().to_string())
                    .with_cause(error.to_string())
            })?;
            if count == 0 {
                return Err(AppError::new("share_source_truncated", "待发送文件被截断")
                    .with_context("path", plan.source_path.to_string_lossy().to_string())
                    .with_context("offset", offset.to_string()));
            }

            match self.post_chunk(url.as_str(), offset, buffer[..count].to_vec()).await {
                Ok(()) => {
                    range_retries = 0;
                    offset += count as u64;
                    snapshot.transferred_bytes = base + offset.min(declared);
                    if snapshot.status == SessionStatus::Accepted {
                        snapshot.status = SessionStatus::Receiving;
                    }
                    self.maybe_emit_session_snapshot(snapshot, last_emit);
                }
                Err(error)
                    if error.code == "share_range_invalid" && range_retries < MAX_RANGE_RETRY =>
                {
                    // the receiver's size moved under us; realign and go on
                    range_retries += 1;
                    offset = self.probe_remote_size(url.as_str()).await?.min(declared);
                    file.seek(SeekFrom::Start(offset)).await.map_err(|error| {
                        AppError::new("share_source_seek_failed", "定位待发送文件失败")
                            .with_cause(error.to_string())
                    })?;
                    snapshot.transferred_bytes = base + offset;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn probe_remote_size(&self, url: &str) -> AppResult<u64> {
        let response = self.client.get(url).send().await.map_err(|error| {
            AppError::new("share_probe_failed", "查询对方续传进度失败")
                .with_cause(error.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(remote_error(response, status).await);
        }

        let probe = response.json::<ResumeProbeDto>().await.map_err(|error| {
            AppError::new("share_probe_failed", "解析续传进度失败").with_cause(error.to_string())
        })?;
        Ok(if probe.exists { probe.size } else { 0 })
    }

    async fn post_chunk(&self, url: &str, offset: u64, bytes: Vec<u8>) -> AppResult<()> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::RANGE, format!("bytes={offset}-"))
            .body(bytes)
            .send()
            .await
            .map_err(|error| {
                AppError::new("share_upload_failed", "发送文件块失败")
                    .with_cause(error.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(remote_error(response, status).await)
    }

    fn maybe_emit_session_snapshot(&self, snapshot: &SessionSnapshotDto, last_emit: &mut Instant) {
        if last_emit.elapsed() >= Duration::from_millis(SEND_EMIT_INTERVAL_MS) {
            *last_emit = Instant::now();
            self.emit_session_snapshot(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_for_should_map_common_extensions() {
        assert_eq!(file_type_for("notes.TXT"), "text/plain");
        assert_eq!(file_type_for("photo.jpeg"), "image/jpeg");
        assert_eq!(file_type_for("backup.tar.gz"), "application/octet-stream");
        assert_eq!(file_type_for("no_extension"), "application/octet-stream");
    }
}
