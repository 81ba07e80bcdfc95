//! In-memory table of active transfer sessions and their per-file tokens.
//!
//! Every public operation is a single lock scope; nothing is held across an
//! await. The upload path revalidates status and token inside `record_*`
//! calls because the disk write between validation and accounting is a
//! suspension point.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex as AsyncMutex;

use infra::receipt;
use protocol::models::{
    FileMetadataDto, PeerDeviceDto, SessionFileSnapshotDto, SessionSnapshotDto, SessionStatus,
};
use protocol::{AppError, AppResult};

use crate::{SESSION_CANCELLED_CODE, random_hex};

const TOKEN_BYTES: usize = 16;

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

fn session_not_found(session_id: &str) -> AppError {
    AppError::new("share_session_not_found", "会话不存在")
        .with_context("sessionId", session_id.to_string())
}

#[derive(Debug, Clone)]
struct FileSlot {
    metadata: FileMetadataDto,
    token: String,
    received: bool,
    received_bytes: u64,
    target_path: PathBuf,
    /// Serializes writes for this slot so the offset check in the receipt
    /// engine sees a settled size.
    write_gate: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Clone)]
struct TransferSession {
    sender: PeerDeviceDto,
    status: SessionStatus,
    created_at: i64,
    finished_at: Option<i64>,
    files: HashMap<String, FileSlot>,
}

/// What an upload call is allowed to touch, handed out after validation.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    pub target_path: PathBuf,
    pub declared_size: u64,
    pub sha256: Option<String>,
    pub write_gate: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Probe,
    Write,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOutcome {
    pub file_completed: bool,
    pub session_completed: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, TransferSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `pending` session with one unguessable token per manifest
    /// entry. Destination paths are resolved once here so resumes keep
    /// writing to the same file even if a same-named file appears later.
    pub fn create(
        &self,
        sender: PeerDeviceDto,
        manifest: &HashMap<String, FileMetadataDto>,
        download_dir: &Path,
        now: i64,
    ) -> (String, HashMap<String, String>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut tokens = HashMap::with_capacity(manifest.len());
        let mut files = HashMap::with_capacity(manifest.len());
        let mut used_paths: HashSet<PathBuf> = HashSet::new();

        for (file_id, metadata) in manifest {
            let mut target_path =
                receipt::resolve_conflict_path(&receipt::resolve_target_path(
                    download_dir,
                    &metadata.file_name,
                ));
            // two manifest entries may share a file name; disk probing alone
            // cannot see the sibling slot
            while used_paths.contains(&target_path) {
                target_path = receipt::resolve_conflict_path(&target_path.with_file_name(
                    format!(
                        "{} (copy)",
                        target_path
                            .file_name()
                            .map(|value| value.to_string_lossy().to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    ),
                ));
            }
            used_paths.insert(target_path.clone());

            let token = random_hex(TOKEN_BYTES);
            tokens.insert(file_id.clone(), token.clone());
            files.insert(
                file_id.clone(),
                FileSlot {
                    metadata: metadata.clone(),
                    token,
                    received: false,
                    received_bytes: 0,
                    target_path,
                    write_gate: Arc::new(AsyncMutex::new(())),
                },
            );
        }

        let session = TransferSession {
            sender,
            status: SessionStatus::Pending,
            created_at: now,
            finished_at: None,
            files,
        };
        write_lock(&self.sessions, "sessions").insert(session_id.clone(), session);
        (session_id, tokens)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        read_lock(&self.sessions, "sessions")
            .get(session_id)
            .map(|session| session.status)
    }

    pub fn accept(&self, session_id: &str) -> AppResult<()> {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;

        if session.status == SessionStatus::Cancelled {
            return Err(AppError::new(SESSION_CANCELLED_CODE, "传输已取消")
                .with_context("sessionId", session_id.to_string()));
        }
        if !session.status.can_transition_to(SessionStatus::Accepted) {
            return Err(AppError::new("share_session_not_acceptable", "会话状态不允许接受")
                .with_context("sessionId", session_id.to_string())
                .with_context("status", session.status.as_str().to_string()));
        }
        session.status = SessionStatus::Accepted;
        Ok(())
    }

    /// Idempotent. Completed sessions are left alone; anything else diverts
    /// to cancelled.
    pub fn cancel(&self, session_id: &str, now: i64) -> Option<SessionStatus> {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let session = sessions.get_mut(session_id)?;

        if session.status.can_transition_to(SessionStatus::Cancelled)
            && session.status != SessionStatus::Cancelled
        {
            session.status = SessionStatus::Cancelled;
            session.finished_at = Some(now);
        }
        Some(session.status)
    }

    pub fn remove(&self, session_id: &str) {
        write_lock(&self.sessions, "sessions").remove(session_id);
    }

    /// Validates session state and the per-file token for an upload call.
    /// Probes are also allowed while the session is still pending.
    pub fn validate_upload(
        &self,
        session_id: &str,
        file_id: &str,
        token: &str,
        mode: UploadMode,
    ) -> AppResult<UploadGrant> {
        let sessions = read_lock(&self.sessions, "sessions");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;

        let allowed = match mode {
            UploadMode::Probe => matches!(
                session.status,
                SessionStatus::Pending | SessionStatus::Accepted | SessionStatus::Receiving
            ),
            UploadMode::Write => matches!(
                session.status,
                SessionStatus::Accepted | SessionStatus::Receiving
            ),
        };
        if !allowed {
            if session.status == SessionStatus::Cancelled {
                return Err(AppError::new(SESSION_CANCELLED_CODE, "传输已取消")
                    .with_context("sessionId", session_id.to_string()));
            }
            return Err(AppError::new("share_session_not_accepted", "会话未进入可接收状态")
                .with_context("sessionId", session_id.to_string())
                .with_context("status", session.status.as_str().to_string()));
        }

        let slot = session.files.get(file_id).ok_or_else(|| {
            AppError::new("share_file_not_found", "会话中不存在该文件")
                .with_context("sessionId", session_id.to_string())
                .with_context("fileId", file_id.to_string())
        })?;

        if slot.token != token {
            return Err(AppError::new("share_token_invalid", "上传令牌校验失败")
                .with_context("sessionId", session_id.to_string())
                .with_context("fileId", file_id.to_string()));
        }

        Ok(UploadGrant {
            target_path: slot.target_path.clone(),
            declared_size: slot.metadata.size,
            sha256: slot.metadata.sha256.clone(),
            write_gate: slot.write_gate.clone(),
        })
    }

    /// First accepted write moves the session into `receiving`.
    pub fn begin_receiving(&self, session_id: &str) -> AppResult<()> {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;

        if session.status == SessionStatus::Receiving {
            return Ok(());
        }
        if !session.status.can_transition_to(SessionStatus::Receiving) {
            if session.status == SessionStatus::Cancelled {
                return Err(AppError::new(SESSION_CANCELLED_CODE, "传输已取消")
                    .with_context("sessionId", session_id.to_string()));
            }
            return Err(AppError::new("share_session_not_accepted", "会话未进入可接收状态")
                .with_context("sessionId", session_id.to_string()));
        }
        session.status = SessionStatus::Receiving;
        Ok(())
    }

    /// Progress accounting after a successful disk write. Fails when the
    /// session was cancelled mid-flight so the handler discards the call.
    pub fn record_progress(
        &self,
        session_id: &str,
        file_id: &str,
        new_size: u64,
    ) -> AppResult<()> {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        if session.status == SessionStatus::Cancelled {
            return Err(AppError::new(SESSION_CANCELLED_CODE, "传输已取消")
                .with_context("sessionId", session_id.to_string()));
        }
        let slot = session.files.get_mut(file_id).ok_or_else(|| {
            AppError::new("share_file_not_found", "会话中不存在该文件")
                .with_context("sessionId", session_id.to_string())
                .with_context("fileId", file_id.to_string())
        })?;
        slot.received_bytes = new_size;
        Ok(())
    }

    /// Marks a slot received once its bytes (and checksum, when declared)
    /// check out, completing the session when it was the last one.
    pub fn mark_received(
        &self,
        session_id: &str,
        file_id: &str,
        now: i64,
    ) -> AppResult<ReceiveOutcome> {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        if session.status == SessionStatus::Cancelled {
            return Err(AppError::new(SESSION_CANCELLED_CODE, "传输已取消")
                .with_context("sessionId", session_id.to_string()));
        }

        let slot = session.files.get_mut(file_id).ok_or_else(|| {
            AppError::new("share_file_not_found", "会话中不存在该文件")
                .with_context("sessionId", session_id.to_string())
                .with_context("fileId", file_id.to_string())
        })?;
        let file_completed = !slot.received;
        slot.received = true;

        let all_received = session.files.values().all(|slot| slot.received);
        let mut session_completed = false;
        if all_received && session.status.can_transition_to(SessionStatus::Completed) {
            session.status = SessionStatus::Completed;
            session.finished_at = Some(now);
            session_completed = true;
        }

        Ok(ReceiveOutcome {
            file_completed,
            session_completed,
        })
    }

    /// Checksum mismatch rolls a slot back so the sender can restart it from
    /// offset zero.
    pub fn reset_slot(&self, session_id: &str, file_id: &str) {
        let mut sessions = write_lock(&self.sessions, "sessions");
        if let Some(session) = sessions.get_mut(session_id) {
            if let Some(slot) = session.files.get_mut(file_id) {
                slot.received = false;
                slot.received_bytes = 0;
            }
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshotDto> {
        let sessions = read_lock(&self.sessions, "sessions");
        let session = sessions.get(session_id)?;

        let mut files: Vec<SessionFileSnapshotDto> = session
            .files
            .iter()
            .map(|(file_id, slot)| SessionFileSnapshotDto {
                id: file_id.clone(),
                file_name: slot.metadata.file_name.clone(),
                size: slot.metadata.size,
                received: slot.received,
            })
            .collect();
        files.sort_by(|left, right| left.id.cmp(&right.id));

        Some(SessionSnapshotDto {
            session_id: session_id.to_string(),
            sender_fingerprint: session.sender.fingerprint.clone(),
            sender_alias: session.sender.alias.clone(),
            status: session.status,
            total_bytes: session.files.values().map(|slot| slot.metadata.size).sum(),
            transferred_bytes: session
                .files
                .values()
                .map(|slot| slot.received_bytes.min(slot.metadata.size))
                .sum(),
            created_at: session.created_at,
            files,
        })
    }

    /// Drops sessions that reached a terminal state more than `retention_ms`
    /// ago. Active sessions are never collected.
    pub fn sweep_terminal(&self, now: i64, retention_ms: i64) -> usize {
        let mut sessions = write_lock(&self.sessions, "sessions");
        let before = sessions.len();
        sessions.retain(|_, session| {
            if !session.status.is_terminal() {
                return true;
            }
            let finished_at = session.finished_at.unwrap_or(session.created_at);
            now - finished_at <= retention_ms
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.sessions, "sessions").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
