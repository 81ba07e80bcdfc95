//! The four-step negotiation handshake plus the diagnostics endpoint,
//! HTTP-shaped: register, prepare-upload, upload (probe/write), cancel, info.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use infra::receipt;
use protocol::models::{
    DeviceInfoDto, DeviceProtocol, PeerDeviceDto, PrepareUploadRequestDto,
    PrepareUploadResponseDto, ResumeProbeDto, SenderInfoDto,
};
use protocol::{AppError, now_millis};

use crate::http::ServerContext;
use crate::sessions::UploadMode;

pub(crate) struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "share_session_not_found" | "share_file_not_found" => StatusCode::NOT_FOUND,
        "share_pin_invalid"
        | "share_token_invalid"
        | "share_transfer_rejected"
        | "share_session_not_accepted"
        | "share_session_not_acceptable"
        | "share_session_cancelled"
        | "share_checksum_mismatch" => StatusCode::FORBIDDEN,
        "share_range_invalid" => StatusCode::RANGE_NOT_SATISFIABLE,
        "share_missing_param" | "share_manifest_empty" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_code(&self.0.code);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(
                event = "share_request_failed",
                error_code = self.0.code,
                error_detail = self.0.causes.first().map(String::as_str).unwrap_or_default()
            );
        }
        (status, Json(self.0)).into_response()
    }
}

pub fn build_router(context: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/localsend/v2/register", post(register))
        .route("/api/localsend/v2/prepare-upload", post(prepare_upload))
        .route("/api/localsend/v2/upload", post(upload).get(resume_probe))
        .route("/api/localsend/v2/cancel", post(cancel))
        .route("/api/localsend/v2/info", get(info))
        .with_state(context)
}

fn emit_session_sync(context: &ServerContext, session_id: &str) {
    if let Some(snapshot) = context.sessions.snapshot(session_id) {
        if let Err(error) = context.event_sink.emit_session_sync(&snapshot) {
            tracing::warn!(
                event = "share_event_emit_failed",
                event_name = "share_session_sync",
                error_code = error.code
            );
        }
    }
}

fn peer_from_sender_info(info: SenderInfoDto, ip_address: String, now: i64) -> PeerDeviceDto {
    PeerDeviceDto {
        fingerprint: info.fingerprint,
        alias: info.alias,
        device_type: info.device_type,
        device_model: info.device_model,
        ip_address,
        port: protocol::DEFAULT_SERVER_PORT,
        protocol: DeviceProtocol::Http,
        version: info.version,
        last_seen: now,
        is_online: true,
    }
}

/// Identity exchange, triggered by a multicast beacon or a manual connect.
/// Always succeeds; never touches the session registry.
async fn register(
    State(context): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<DeviceInfoDto>,
) -> Json<DeviceInfoDto> {
    if body.fingerprint != context.self_fingerprint {
        let now = now_millis();
        let peer = body.into_peer(addr.ip().to_string(), now);
        tracing::info!(
            event = "share_peer_registered",
            alias = peer.alias,
            address = peer.ip_address
        );
        context.devices.upsert(peer, now);

        if let Err(error) = context.event_sink.emit_device_sync(&context.devices.list()) {
            tracing::warn!(
                event = "share_event_emit_failed",
                event_name = "share_device_sync",
                error_code = error.code
            );
        }
    }

    Json(context.self_description())
}

#[derive(Debug, Deserialize)]
struct PrepareQuery {
    pin: Option<String>,
}

async fn prepare_upload(
    State(context): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<PrepareQuery>,
    Json(request): Json<PrepareUploadRequestDto>,
) -> Result<Json<PrepareUploadResponseDto>, ApiError> {
    let settings = context.settings_snapshot();

    if settings.require_pin {
        let provided = query.pin.unwrap_or_default();
        if provided.is_empty() || provided != settings.pin {
            return Err(AppError::new("share_pin_invalid", "PIN 校验失败").into());
        }
    }

    if request.files.is_empty() {
        return Err(AppError::new("share_manifest_empty", "传输清单不能为空").into());
    }

    let now = now_millis();
    let sender = peer_from_sender_info(request.info.clone(), addr.ip().to_string(), now);

    let download_dir = settings.download_dir.clone();
    receipt::ensure_download_dir(Path::new(&download_dir)).await?;

    let (session_id, tokens) =
        context
            .sessions
            .create(sender, &request.files, Path::new(&download_dir), now);
    tracing::info!(
        event = "share_session_created",
        session_id = session_id,
        file_count = request.files.len(),
        auto_accept = settings.auto_accept
    );

    if settings.auto_accept {
        context.sessions.accept(&session_id)?;
    } else {
        let rx = context.pending.register(&session_id);
        if let Err(error) = context.event_sink.emit_incoming_request(&session_id, &request) {
            tracing::warn!(
                event = "share_event_emit_failed",
                event_name = "share_incoming_request",
                error_code = error.code
            );
        }

        // the response is deliberately held open until the user decides or
        // the window elapses
        let accepted = context
            .pending
            .await_decision(&session_id, rx, settings.accept_timeout_ms)
            .await;
        if !accepted {
            context.sessions.remove(&session_id);
            tracing::info!(event = "share_session_rejected", session_id = session_id);
            return Err(AppError::new("share_transfer_rejected", "对方拒绝了传输请求")
                .with_context("sessionId", session_id)
                .into());
        }
        context.sessions.accept(&session_id)?;
    }

    emit_session_sync(&context, &session_id);
    Ok(Json(PrepareUploadResponseDto {
        session_id,
        files: tokens,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadQuery {
    session_id: Option<String>,
    file_id: Option<String>,
    token: Option<String>,
}

fn require_upload_params(query: UploadQuery) -> Result<(String, String, String), ApiError> {
    let session_id = query.session_id.unwrap_or_default();
    let file_id = query.file_id.unwrap_or_default();
    let token = query.token.unwrap_or_default();
    if session_id.is_empty() || file_id.is_empty() || token.is_empty() {
        return Err(AppError::new("share_missing_param", "缺少必要的请求参数")
            .with_context("required", "sessionId, fileId, token")
            .into());
    }
    Ok((session_id, file_id, token))
}

/// `Range: bytes=<start>-` → start offset. No header means a fresh write at
/// offset zero; anything else malformed is a range error, not a server error.
fn parse_range_start(headers: &HeaderMap) -> Result<u64, ApiError> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(0);
    };
    let text = value.to_str().map_err(|_| range_invalid("non-ascii header"))?;
    let spec = text
        .strip_prefix("bytes=")
        .ok_or_else(|| range_invalid(text))?;
    let start = spec.split('-').next().unwrap_or_default();
    if start.is_empty() {
        return Err(range_invalid(text));
    }
    start
        .trim()
        .parse::<u64>()
        .map_err(|_| range_invalid(text))
}

fn range_invalid(detail: &str) -> ApiError {
    AppError::new("share_range_invalid", "Range 请求头不合法")
        .with_context("range", detail.to_string())
        .into()
}

/// Read-only existence/size check so the sender can compute the next write
/// offset. Allowed while the session is still pending.
async fn resume_probe(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<UploadQuery>,
) -> Result<Json<ResumeProbeDto>, ApiError> {
    let (session_id, file_id, token) = require_upload_params(query)?;
    let grant =
        context
            .sessions
            .validate_upload(&session_id, &file_id, &token, UploadMode::Probe)?;
    let probe = receipt::probe(&grant.target_path).await?;
    Ok(Json(probe))
}

async fn upload(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (session_id, file_id, token) = require_upload_params(query)?;
    let offset = parse_range_start(&headers)?;

    let grant =
        context
            .sessions
            .validate_upload(&session_id, &file_id, &token, UploadMode::Write)?;

    // writes to one slot are serialized; the offset check below sees a
    // settled size
    let _gate = grant.write_gate.lock().await;

    // revalidate after the suspension: cancel may have landed while queued
    context
        .sessions
        .validate_upload(&session_id, &file_id, &token, UploadMode::Write)?;
    context.sessions.begin_receiving(&session_id)?;

    let new_size = receipt::append_chunk(&grant.target_path, offset, &body).await?;
    context.sessions.record_progress(&session_id, &file_id, new_size)?;

    if new_size >= grant.declared_size {
        if let Some(expected) = grant.sha256.clone() {
            let path = grant.target_path.clone();
            let verified =
                tokio::task::spawn_blocking(move || receipt::verify_sha256(&path, &expected))
                    .await;
            match verified {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    // roll the slot back so the sender can restart from zero
                    let _ = tokio::fs::remove_file(&grant.target_path).await;
                    context.sessions.reset_slot(&session_id, &file_id);
                    return Err(error.into());
                }
                Err(join_error) => {
                    return Err(AppError::new("share_checksum_failed", "校验和计算失败")
                        .with_cause(join_error.to_string())
                        .into());
                }
            }
        }

        let outcome = context.sessions.mark_received(&session_id, &file_id, now_millis())?;
        if outcome.session_completed {
            tracing::info!(event = "share_session_completed", session_id = session_id);
        }
    }

    emit_session_sync(&context, &session_id);
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelQuery {
    session_id: Option<String>,
}

/// Idempotent abort. Missing sessions still answer 200: the sender only
/// needs to know the session is gone.
async fn cancel(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = query.session_id.unwrap_or_default();
    if session_id.is_empty() {
        return Err(AppError::new("share_missing_param", "缺少必要的请求参数")
            .with_context("required", "sessionId")
            .into());
    }

    context.pending.resolve(&session_id, false);
    if context.sessions.cancel(&session_id, now_millis()).is_some() {
        tracing::info!(event = "share_session_cancel_requested", session_id = session_id);
        emit_session_sync(&context, &session_id);
    }
    Ok(Json(json!({})))
}

async fn info(State(context): State<Arc<ServerContext>>) -> Json<DeviceInfoDto> {
    Json(context.self_description())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().expect("header value"));
        headers
    }

    #[test]
    fn parse_range_start_should_default_to_zero() {
        let offset = parse_range_start(&HeaderMap::new()).expect("no header");
        assert_eq!(offset, 0);
    }

    #[test]
    fn parse_range_start_should_accept_open_ended_ranges() {
        let offset =
            parse_range_start(&headers_with_range("bytes=100-")).expect("open-ended range");
        assert_eq!(offset, 100);

        let offset =
            parse_range_start(&headers_with_range("bytes=0-499")).expect("bounded range");
        assert_eq!(offset, 0);
    }

    #[test]
    fn parse_range_start_should_reject_malformed_specs() {
        for value in ["items=3-", "bytes=-500", "bytes=abc-"] {
            let error = parse_range_start(&headers_with_range(value)).expect_err(value);
            assert_eq!(status_for_code(&error.0.code), StatusCode::RANGE_NOT_SATISFIABLE);
        }
    }

    #[test]
    fn status_mapping_should_cover_the_error_taxonomy() {
        assert_eq!(status_for_code("share_session_not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_code("share_token_invalid"), StatusCode::FORBIDDEN);
        assert_eq!(status_for_code("share_pin_invalid"), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for_code("share_range_invalid"),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(status_for_code("share_missing_param"), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for_code("share_target_write_failed"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
