//! Out-of-band peer resolution: literal IP probe or connection-key lookup.
//! Hashtag pairing has no unicast path and stays on multicast discovery.

use std::time::Duration;

use protocol::models::{DeviceInfoDto, PeerDeviceDto};
use protocol::{DEFAULT_SERVER_PORT, MANUAL_PROBE_TIMEOUT_MS, now_millis};

use crate::registry::DeviceRegistry;

/// Time-boxed register probe against a literal address. Timeout and refusal
/// are both reported as "not found"; the caller cannot tell them apart.
pub async fn connect_by_ip(
    client: &reqwest::Client,
    ip: &str,
    self_description: &DeviceInfoDto,
) -> Option<PeerDeviceDto> {
    probe_register(client, ip, DEFAULT_SERVER_PORT, self_description).await
}

pub(crate) async fn probe_register(
    client: &reqwest::Client,
    ip: &str,
    port: u16,
    self_description: &DeviceInfoDto,
) -> Option<PeerDeviceDto> {
    let url = format!("http://{ip}:{port}/api/localsend/v2/register");
    let response = client
        .post(&url)
        .timeout(Duration::from_millis(MANUAL_PROBE_TIMEOUT_MS))
        .json(self_description)
        .send()
        .await
        .ok()?;

    if !response.status().is_success() {
        return None;
    }

    let info = response.json::<DeviceInfoDto>().await.ok()?;
    if info.fingerprint == self_description.fingerprint {
        return None;
    }

    Some(info.into_peer(ip.to_string(), now_millis()))
}

/// Resolves a connection key against already-discovered peers only.
pub fn connect_by_key(registry: &DeviceRegistry, key: &str) -> Option<PeerDeviceDto> {
    registry.find_by_key(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::models::{DeviceKind, DeviceProtocol};

    fn self_description() -> DeviceInfoDto {
        DeviceInfoDto {
            alias: "local".to_string(),
            version: "2.0".to_string(),
            device_model: None,
            device_type: DeviceKind::Headless,
            fingerprint: "0011223344556677".to_string(),
            port: DEFAULT_SERVER_PORT,
            protocol: DeviceProtocol::Http,
            download: false,
        }
    }

    #[tokio::test]
    async fn connect_by_ip_should_return_none_when_nothing_listens() {
        let client = reqwest::Client::new();
        // unbound local port refuses immediately, well inside the 1s budget
        let started = std::time::Instant::now();
        let result = probe_register(&client, "127.0.0.1", 1, &self_description()).await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn connect_by_key_should_only_search_known_peers() {
        let registry = DeviceRegistry::new();
        assert!(connect_by_key(&registry, "A7F3-9B2E").is_none());

        registry.upsert(
            PeerDeviceDto {
                fingerprint: "a7f39b2e44556677".to_string(),
                alias: "phone".to_string(),
                device_type: DeviceKind::Mobile,
                device_model: None,
                ip_address: "192.168.1.30".to_string(),
                port: 53317,
                protocol: DeviceProtocol::Http,
                version: "2.0".to_string(),
                last_seen: 0,
                is_online: true,
            },
            1,
        );

        let found = connect_by_key(&registry, "a7f39b2e").expect("lookup");
        assert_eq!(found.alias, "phone");
    }
}
