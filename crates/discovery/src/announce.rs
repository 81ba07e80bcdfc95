//! Multicast presence beacons.
//!
//! Two sockets, two loops: a send socket bound to an ephemeral port
//! broadcasting the announcement every interval, and a listen socket
//! joined to the group translating beacons into `DiscoveryEvent`s. Receiving
//! a beacon also fires a best-effort unicast register POST back at the
//! announcer so two passive listeners become mutually known without waiting
//! for both to beacon.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;

use protocol::models::{DeviceAnnouncementDto, DeviceInfoDto, PeerDeviceDto};
use protocol::{
    AppError, AppResult, MULTICAST_GROUP, MULTICAST_PORT, REGISTER_TIMEOUT_MS, now_millis,
};

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerSeen(PeerDeviceDto),
}

/// Binds and joins the beacon receive socket. Bind/join failures propagate to
/// the discovery start path so the caller can fall back or surface them.
pub async fn bind_beacon_socket() -> AppResult<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", MULTICAST_PORT))
        .await
        .map_err(|error| {
            AppError::new("share_discovery_bind_failed", "发现服务绑定端口失败")
                .with_context("port", MULTICAST_PORT.to_string())
                .with_cause(error.to_string())
        })?;
    socket
        .join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)
        .map_err(|error| {
            AppError::new("share_discovery_join_failed", "加入组播组失败")
                .with_context("group", MULTICAST_GROUP.to_string())
                .with_cause(error.to_string())
        })?;
    Ok(socket)
}

pub async fn run_announce_loop(
    stop: Arc<AtomicBool>,
    announcement: DeviceAnnouncementDto,
    interval_ms: u64,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(value) => value,
        Err(error) => {
            tracing::error!(
                event = "share_announce_bind_failed",
                error = error.to_string()
            );
            return;
        }
    };

    let target = SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT));
    while !stop.load(Ordering::Relaxed) {
        match serde_json::to_vec(&announcement) {
            Ok(bytes) => {
                if let Err(error) = socket.send_to(bytes.as_slice(), target).await {
                    tracing::warn!(
                        event = "share_announce_send_failed",
                        error = error.to_string()
                    );
                }
            }
            Err(error) => {
                tracing::warn!(
                    event = "share_announce_serialize_failed",
                    error = error.to_string()
                );
            }
        }

        sleep(Duration::from_millis(interval_ms)).await;
    }
}

/// Parses and validates a raw beacon. Foreign or malformed traffic on the
/// group yields `None`.
pub fn parse_beacon(payload: &[u8]) -> Option<DeviceAnnouncementDto> {
    let announcement = serde_json::from_slice::<DeviceAnnouncementDto>(payload).ok()?;
    announcement.is_valid().then_some(announcement)
}

pub async fn run_beacon_listen_loop(
    stop: Arc<AtomicBool>,
    socket: UdpSocket,
    self_fingerprint: String,
    self_description: DeviceInfoDto,
    client: reqwest::Client,
    events_tx: mpsc::Sender<DiscoveryEvent>,
) {
    let mut buffer = vec![0u8; 4096];

    while !stop.load(Ordering::Relaxed) {
        tokio::select! {
            recv = socket.recv_from(buffer.as_mut_slice()) => {
                let Ok((size, addr)) = recv else {
                    continue;
                };
                if size == 0 {
                    continue;
                }

                let Some(announcement) = parse_beacon(&buffer[..size]) else {
                    continue;
                };
                if announcement.fingerprint == self_fingerprint {
                    continue;
                }

                let peer = announcement.into_peer(addr.ip().to_string(), now_millis());

                send_register_best_effort(client.clone(), peer.clone(), self_description.clone());

                if events_tx.send(DiscoveryEvent::PeerSeen(peer)).await.is_err() {
                    break;
                }
            }
            _ = sleep(Duration::from_millis(300)) => {}
        }
    }

    // Tolerate "not joined": the socket may have been handed over before the
    // group membership stuck.
    let _ = socket.leave_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED);
}

/// Unicast register POST to a just-seen announcer. The peer's HTTP service
/// may not be up yet, so failures are swallowed and logged at debug. Register
/// always goes over plain HTTP; the announcer's TLS listener may not exist.
fn send_register_best_effort(
    client: reqwest::Client,
    peer: PeerDeviceDto,
    self_description: DeviceInfoDto,
) {
    tokio::spawn(async move {
        let url = format!(
            "http://{}:{}/api/localsend/v2/register",
            peer.ip_address, peer.port
        );
        let result = client
            .post(&url)
            .timeout(Duration::from_millis(REGISTER_TIMEOUT_MS))
            .json(&self_description)
            .send()
            .await;

        if let Err(error) = result {
            tracing::debug!(
                event = "share_register_response_failed",
                peer = peer.alias,
                url,
                error = error.to_string()
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_beacon_should_reject_foreign_traffic() {
        assert!(parse_beacon(b"not json").is_none());
        assert!(parse_beacon(b"{\"alias\":\"x\"}").is_none());

        let missing_announce = serde_json::json!({
            "alias": "Desk",
            "version": "2.0",
            "deviceType": "desktop",
            "fingerprint": "feedfacecafebeef",
            "port": 53317,
            "protocol": "http",
        });
        assert!(parse_beacon(missing_announce.to_string().as_bytes()).is_none());
    }

    #[test]
    fn parse_beacon_should_accept_valid_announcement() {
        let payload = serde_json::json!({
            "alias": "Desk",
            "version": "2.0",
            "deviceType": "desktop",
            "fingerprint": "feedfacecafebeef",
            "port": 53317,
            "protocol": "http",
            "announce": true,
        });

        let announcement =
            parse_beacon(payload.to_string().as_bytes()).expect("valid beacon");
        assert_eq!(announcement.fingerprint, "feedfacecafebeef");
        assert_eq!(announcement.port, 53317);
    }
}
