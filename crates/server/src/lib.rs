pub mod event_sink;
pub mod http;
pub mod pending;
pub mod proxy;
pub mod routes;
pub mod sessions;

pub use event_sink::{NoopShareEventSink, ShareEventSink};
pub use http::{ServerContext, bind_listener, serve};
pub use pending::PendingAcceptances;
pub use sessions::SessionRegistry;

pub use protocol::{AppError, AppResult, ResultExt};

pub(crate) const SESSION_CANCELLED_CODE: &str = "share_session_cancelled";

pub(crate) fn random_hex(bytes: usize) -> String {
    use rand::RngCore;

    let mut value = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut value);
    let mut output = String::with_capacity(value.len() * 2);
    for byte in value {
        output.push_str(format!("{byte:02x}").as_str());
    }
    output
}
