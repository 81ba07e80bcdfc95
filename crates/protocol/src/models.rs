use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Mobile,
    Desktop,
    Web,
    Headless,
    Server,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
            Self::Web => "web",
            Self::Headless => "headless",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProtocol {
    Http,
    Https,
}

impl DeviceProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A peer as tracked by the device registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDeviceDto {
    pub fingerprint: String,
    pub alias: String,
    pub device_type: DeviceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub ip_address: String,
    pub port: u16,
    pub protocol: DeviceProtocol,
    pub version: String,
    pub last_seen: i64,
    pub is_online: bool,
}

/// Multicast beacon payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAnnouncementDto {
    pub alias: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub device_type: DeviceKind,
    pub fingerprint: String,
    pub port: u16,
    pub protocol: DeviceProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<bool>,
    #[serde(default)]
    pub announce: bool,
}

impl DeviceAnnouncementDto {
    /// Beacons missing identity fields are discarded, not rejected with an
    /// error: the multicast group carries foreign traffic too.
    pub fn is_valid(&self) -> bool {
        self.announce && !self.alias.trim().is_empty() && !self.fingerprint.trim().is_empty()
    }

    pub fn into_peer(self, ip_address: String, now: i64) -> PeerDeviceDto {
        PeerDeviceDto {
            fingerprint: self.fingerprint,
            alias: self.alias,
            device_type: self.device_type,
            device_model: self.device_model,
            ip_address,
            port: self.port,
            protocol: self.protocol,
            version: self.version,
            last_seen: now,
            is_online: true,
        }
    }
}

/// Self-description returned by `register` and `info`, also the body of the
/// unicast register POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfoDto {
    pub alias: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub device_type: DeviceKind,
    pub fingerprint: String,
    pub port: u16,
    pub protocol: DeviceProtocol,
    pub download: bool,
}

impl DeviceInfoDto {
    pub fn into_peer(self, ip_address: String, now: i64) -> PeerDeviceDto {
        PeerDeviceDto {
            fingerprint: self.fingerprint,
            alias: self.alias,
            device_type: self.device_type,
            device_model: self.device_model,
            ip_address,
            port: self.port,
            protocol: self.protocol,
            version: self.version,
            last_seen: now,
            is_online: true,
        }
    }
}

/// Sender identity carried inside `prepare-upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfoDto {
    pub alias: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub device_type: DeviceKind,
    pub fingerprint: String,
}

/// File manifest entry. `size` is authoritative for completion detection;
/// `sha256` is optional and verified only when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataDto {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub file_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadRequestDto {
    pub info: SenderInfoDto,
    pub files: HashMap<String, FileMetadataDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadResponseDto {
    pub session_id: String,
    /// fileId -> upload token.
    pub files: HashMap<String, String>,
}

/// Resume probe result for a single file slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeProbeDto {
    pub exists: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Accepted,
    Receiving,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Status only advances forward, or diverts to cancelled from any state
    /// except completed.
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Pending => false,
            Self::Accepted => self == Self::Pending,
            Self::Receiving => matches!(self, Self::Accepted | Self::Receiving),
            Self::Completed => self == Self::Receiving,
            Self::Cancelled => self != Self::Completed,
        }
    }
}

/// Per-file view inside a session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFileSnapshotDto {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub received: bool,
}

/// Progress snapshot emitted to the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshotDto {
    pub session_id: String,
    pub sender_fingerprint: String,
    pub sender_alias: String,
    pub status: SessionStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub created_at: i64,
    pub files: Vec<SessionFileSnapshotDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSettingsDto {
    pub device_alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub device_type: DeviceKind,
    pub server_port: u16,
    pub protocol: DeviceProtocol,
    pub download_dir: String,
    pub require_pin: bool,
    pub pin: String,
    pub auto_accept: bool,
    pub discovery_enabled: bool,
    pub announcement_interval_ms: u64,
    pub device_timeout_ms: i64,
    pub accept_timeout_ms: u64,
    pub session_retention_ms: i64,
}

impl ShareSettingsDto {
    pub fn with_defaults(device_alias: String, download_dir: String) -> Self {
        Self {
            device_alias,
            device_model: None,
            device_type: DeviceKind::Headless,
            server_port: crate::DEFAULT_SERVER_PORT,
            protocol: DeviceProtocol::Http,
            download_dir,
            require_pin: false,
            pin: String::new(),
            auto_accept: false,
            discovery_enabled: true,
            announcement_interval_ms: crate::ANNOUNCEMENT_INTERVAL_MS,
            device_timeout_ms: crate::DEVICE_TIMEOUT_MS,
            accept_timeout_ms: crate::ACCEPT_TIMEOUT_MS,
            session_retention_ms: crate::SESSION_RETENTION_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareUpdateSettingsInputDto {
    pub device_alias: Option<String>,
    pub server_port: Option<u16>,
    pub download_dir: Option<String>,
    pub require_pin: Option<bool>,
    pub pin: Option<String>,
    pub auto_accept: Option<bool>,
    pub discovery_enabled: Option<bool>,
    pub announcement_interval_ms: Option<u64>,
    pub device_timeout_ms: Option<i64>,
    pub accept_timeout_ms: Option<u64>,
    pub session_retention_ms: Option<i64>,
}

pub fn invalid_share_enum(field: &str, value: &str) -> AppError {
    AppError::new("share_data_invalid_enum", "传输数据包含非法枚举值")
        .with_context("field", field.to_string())
        .with_context("value", value.to_string())
}

impl std::str::FromStr for DeviceProtocol {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        if value.eq_ignore_ascii_case("http") {
            return Ok(Self::Http);
        }
        if value.eq_ignore_ascii_case("https") {
            return Ok(Self::Https);
        }
        Err(invalid_share_enum("protocol", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_validation_should_require_identity_fields() {
        let valid = DeviceAnnouncementDto {
            alias: "Fresh Broccoli".to_string(),
            version: "2.0".to_string(),
            device_model: None,
            device_type: DeviceKind::Mobile,
            fingerprint: "a1b2c3d4e5f60718".to_string(),
            port: 53317,
            protocol: DeviceProtocol::Http,
            download: None,
            announce: true,
        };
        assert!(valid.is_valid());

        let mut missing_alias = valid.clone();
        missing_alias.alias = "  ".to_string();
        assert!(!missing_alias.is_valid());

        let mut not_announcing = valid.clone();
        not_announcing.announce = false;
        assert!(!not_announcing.is_valid());
    }

    #[test]
    fn announcement_wire_format_should_use_camel_case() {
        let payload = serde_json::json!({
            "alias": "Desk",
            "version": "2.0",
            "deviceModel": "MacBook",
            "deviceType": "desktop",
            "fingerprint": "feedfacecafebeef",
            "port": 53317,
            "protocol": "http",
            "announce": true,
        });

        let announcement: DeviceAnnouncementDto =
            serde_json::from_value(payload).expect("decode beacon");
        assert_eq!(announcement.device_model.as_deref(), Some("MacBook"));
        assert_eq!(announcement.device_type, DeviceKind::Desktop);
        assert!(announcement.is_valid());
    }

    #[test]
    fn session_status_should_only_advance_forward() {
        use SessionStatus::*;

        assert!(Pending.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Receiving));
        assert!(Receiving.can_transition_to(Receiving));
        assert!(Receiving.can_transition_to(Completed));

        assert!(!Accepted.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Receiving));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn any_non_completed_status_should_allow_cancel() {
        use SessionStatus::*;

        for status in [Pending, Accepted, Receiving, Cancelled] {
            assert!(status.can_transition_to(Cancelled), "{status:?}");
        }
        assert!(!Completed.can_transition_to(Cancelled));
    }
}
