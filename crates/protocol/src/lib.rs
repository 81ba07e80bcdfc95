use std::net::Ipv4Addr;

mod errors;
pub mod keys;
pub mod models;

pub use errors::{AppError, AppErrorPayload, AppResult, ErrorContextItem, ResultExt};

/// Multicast group the announcement transport joins.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 167);
pub const MULTICAST_PORT: u16 = 53317;

/// Default port for the plaintext negotiation listener. The TLS relay, when
/// enabled, listens on this port + 1.
pub const DEFAULT_SERVER_PORT: u16 = 53317;

pub const PROTOCOL_VERSION: &str = "2.0";

pub const ANNOUNCEMENT_INTERVAL_MS: u64 = 5_000;
pub const DEVICE_TIMEOUT_MS: i64 = 30_000;
pub const DISCOVERY_SWEEP_INTERVAL_MS: u64 = 5_000;
pub const ACCEPT_TIMEOUT_MS: u64 = 120_000;
pub const SESSION_RETENTION_MS: i64 = 300_000;

/// Manual connect probe budget. Refusal and timeout are both reported as
/// "not found" to the caller.
pub const MANUAL_PROBE_TIMEOUT_MS: u64 = 1_000;
/// Best-effort register POST after a beacon; the peer's HTTP service may not
/// be up yet.
pub const REGISTER_TIMEOUT_MS: u64 = 2_000;

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|value| value.as_millis() as i64)
        .unwrap_or_default()
}
