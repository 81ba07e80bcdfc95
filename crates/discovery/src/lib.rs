pub mod announce;
pub mod manual;
pub mod registry;
pub mod scan;

pub use announce::DiscoveryEvent;
pub use registry::DeviceRegistry;

pub use protocol::{AppError, AppResult, ResultExt};

/// Transport capability selected at discovery startup. Hosts without
/// multicast sockets fall back to register-probe scanning instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTransport {
    Multicast,
    HttpScan,
}

impl DiscoveryTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multicast => "multicast",
            Self::HttpScan => "http_scan",
        }
    }
}
