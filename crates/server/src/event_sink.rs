use protocol::AppResult;
use protocol::models::{PeerDeviceDto, PrepareUploadRequestDto, SessionSnapshotDto};

/// Progress/acceptance collaborator implemented by the embedding host. The
/// engine never blocks on these calls except through the pending-acceptance
/// resolver that `emit_incoming_request` is expected to eventually trigger.
pub trait ShareEventSink: Send + Sync {
    fn emit_device_sync(&self, devices: &[PeerDeviceDto]) -> AppResult<()>;
    fn emit_session_sync(&self, snapshot: &SessionSnapshotDto) -> AppResult<()>;
    fn emit_incoming_request(
        &self,
        session_id: &str,
        request: &PrepareUploadRequestDto,
    ) -> AppResult<()>;
}

pub struct NoopShareEventSink;

impl ShareEventSink for NoopShareEventSink {
    fn emit_device_sync(&self, _devices: &[PeerDeviceDto]) -> AppResult<()> {
        Ok(())
    }

    fn emit_session_sync(&self, _snapshot: &SessionSnapshotDto) -> AppResult<()> {
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
