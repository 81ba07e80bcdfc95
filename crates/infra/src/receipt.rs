//! Durable, resumable persistence of inbound file bytes.
//!
//! The write model is append-only: a chunk is accepted only when its start
//! offset equals the current on-disk size. Out-of-order or duplicate delivery
//! is rejected before any byte is written, so it cannot corrupt the file.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{OpenOptions, create_dir_all};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use protocol::models::ResumeProbeDto;
use protocol::{AppError, AppResult};

fn io_error(code: &str, path: &Path, error: std::io::Error) -> AppError {
    AppError::new(code, "文件传输读写失败")
        .with_context("path", path.to_string_lossy().to_string())
        .with_cause(error.to_string())
}

/// Reduces a sender-declared file name to its final path component so a
/// manifest can never escape the download directory.
pub fn sanitize_file_name(file_name: &str) -> String {
    let clean = file_name.replace('\\', "/");
    let component = clean.rsplit('/').next().unwrap_or_default().trim();
    if component.is_empty() || component == "." || component == ".." {
        return "unknown".to_string();
    }
    component.to_string()
}

pub fn resolve_target_path(download_dir: &Path, file_name: &str) -> PathBuf {
    download_dir.join(sanitize_file_name(file_name))
}

pub fn resolve_conflict_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let extension = path
        .extension()
        .map(|value| value.to_string_lossy().to_string());
    let parent = path
        .parent()
        .map(|value| value.to_path_buf())
        .unwrap_or_default();

    for index in 1..10_000 {
        let name = if let Some(ext) = extension.as_deref() {
            format!("{stem} ({index}).{ext}")
        } else {
            format!("{stem} ({index})")
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }

    path.to_path_buf()
}

pub async fn ensure_download_dir(download_dir: &Path) -> AppResult<()> {
    create_dir_all(download_dir)
        .await
        .map_err(|error| io_error("share_download_dir_create_failed", download_dir, error))
}

/// Read-only existence/size check. Never mutates state; the sender uses the
/// reported size as the next write offset.
pub async fn probe(path: &Path) -> AppResult<ResumeProbeDto> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(ResumeProbeDto {
            exists: true,
            size: meta.len(),
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(ResumeProbeDto {
            exists: false,
            size: 0,
        }),
        Err(error) => Err(io_error("share_probe_failed", path, error)),
    }
}

/// Appends `bytes` at `offset`, requiring `offset` to equal the current
/// on-disk size. Returns the new size. The offset check and the write happen
/// against the same open handle, so a stale offset is rejected without
/// touching the file.
pub async fn append_chunk(path: &Path, offset: u64, bytes: &[u8]) -> AppResult<u64> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .map_err(|error| io_error("share_download_dir_create_failed", parent, error))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|error| io_error("share_target_open_failed", path, error))?;

    let current = file
        .metadata()
        .await
        .map_err(|error| io_error("share_target_stat_failed", path, error))?
        .len();
    if offset != current {
        return Err(AppError::new("share_range_invalid", "续传偏移与已接收字节不连续")
            .with_context("path", path.to_string_lossy().to_string())
            .with_context("requestedOffset", offset.to_string())
            .with_context("currentSize", current.to_string()));
    }

    file.seek(std::io::SeekFrom::Start(current))
        .await
        .map_err(|error| io_error("share_target_seek_failed", path, error))?;
    file.write_all(bytes)
        .await
        .map_err(|error| io_error("share_target_write_failed", path, error))?;
    file.flush()
        .await
        .map_err(|error| io_error("share_target_flush_failed", path, error))?;

    Ok(current + bytes.len() as u64)
}

/// Streams the file through SHA-256 and compares with the sender-declared
/// digest (case-insensitive hex).
pub fn verify_sha256(path: &Path, expected_hex: &str) -> AppResult<()> {
    let mut file = std::fs::File::open(path)
        .map_err(|error| io_error("share_target_open_failed", path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read_count = file
            .read(buffer.as_mut_slice())
            .map_err(|error| io_error("share_target_read_failed", path, error))?;
        if read_count == 0 {
            break;
        }
        hasher.update(&buffer[..read_count]);
    }

    let actual = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    if !actual.eq_ignore_ascii_case(expected_hex.trim()) {
        return Err(AppError::new("share_checksum_mismatch", "文件校验和不匹配")
            .with_context("path", path.to_string_lossy().to_string())
            .with_context("expected", expected_hex.trim().to_string())
            .with_context("actual", actual));
    }
    Ok(())
}

/// Digest helper for the outgoing manifest.
pub fn file_sha256_hex(path: &Path) -> AppResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|error| io_error("share_source_open_failed", path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read_count = file
            .read(buffer.as_mut_slice())
            .map_err(|error| io_error("share_source_read_failed", path, error))?;
        if read_count == 0 {
            break;
        }
        hasher.update(&buffer[..read_count]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ldrop-receipt-{prefix}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn sanitize_file_name_should_drop_directories() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a\\b\\c.txt"), "c.txt");
        assert_eq!(sanitize_file_name(".."), "unknown");
        assert_eq!(sanitize_file_name(""), "unknown");
    }

    #[test]
    fn resolve_conflict_path_should_probe_numbered_names() {
        let dir = temp_dir("conflict");
        let original = dir.join("photo.jpg");
        std::fs::write(&original, b"x").expect("write original");
        std::fs::write(dir.join("photo (1).jpg"), b"y").expect("write first conflict");

        let resolved = resolve_conflict_path(&original);
        assert_eq!(resolved, dir.join("photo (2).jpg"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn append_chunk_should_enforce_contiguous_offsets() {
        let dir = temp_dir("append");
        let path = dir.join("payload.bin");

        let size = append_chunk(&path, 0, &[1u8; 100]).await.expect("first write");
        assert_eq!(size, 100);

        let probed = probe(&path).await.expect("probe");
        assert!(probed.exists);
        assert_eq!(probed.size, 100);

        // a stale offset must be rejected without mutating the file
        let error = append_chunk(&path, 50, &[9u8; 10])
            .await
            .expect_err("non-contiguous offset");
        assert_eq!(error.code, "share_range_invalid");
        assert_eq!(std::fs::read(&path).expect("read back"), vec![1u8; 100]);

        let size = append_chunk(&path, 100, &[2u8; 100]).await.expect("resume write");
        assert_eq!(size, 200);

        let content = std::fs::read(&path).expect("read final");
        assert_eq!(&content[..100], &[1u8; 100][..]);
        assert_eq!(&content[100..], &[2u8; 100][..]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn probe_should_report_missing_file() {
        let dir = temp_dir("probe");
        let probed = probe(&dir.join("absent.bin")).await.expect("probe");
        assert!(!probed.exists);
        assert_eq!(probed.size, 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn verify_sha256_should_detect_mismatch() {
        let dir = temp_dir("digest");
        let path = dir.join("doc.txt");
        std::fs::write(&path, b"expected body").expect("write file");

        let digest = file_sha256_hex(&path).expect("digest");
        verify_sha256(&path, &digest).expect("digest should match");
        verify_sha256(&path, &digest.to_ascii_uppercase()).expect("case-insensitive match");

        let error = verify_sha256(&path, "deadbeef").expect_err("mismatch");
        assert_eq!(error.code, "share_checksum_mismatch");

        let _ = std::fs::remove_dir_all(dir);
    }
}
