//! Register-probe discovery for hosts without multicast sockets.
//!
//! Walks common RFC1918 ranges and posts `register` to every address with a
//! 1s budget, in bounded batches so a sweep cannot exhaust sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use protocol::DEFAULT_SERVER_PORT;
use protocol::models::DeviceInfoDto;

use crate::announce::DiscoveryEvent;
use crate::manual::probe_register;

const SCAN_BATCH_SIZE: usize = 20;

/// Common home/office ranges, the same order the probe walks them.
pub fn local_scan_ranges() -> &'static [&'static str] {
    &["192.168.1", "192.168.0", "10.0.0", "172.16.0"]
}

pub fn scan_addresses() -> impl Iterator<Item = String> {
    local_scan_ranges()
        .iter()
        .flat_map(|range| (1u16..=254).map(move |host| format!("{range}.{host}")))
}

pub async fn run_http_scan(
    stop: Arc<AtomicBool>,
    client: reqwest::Client,
    self_description: DeviceInfoDto,
    events_tx: mpsc::Sender<DiscoveryEvent>,
) {
    let mut probes = JoinSet::new();
    let mut found = 0usize;

    for ip in scan_addresses() {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        while probes.len() >= SCAN_BATCH_SIZE {
            if let Some(Ok(Some(peer))) = probes.join_next().await {
                found += 1;
                if events_tx
                    .send(DiscoveryEvent::PeerSeen(peer))
                    .await
                    .is_err()
                {
                    probes.abort_all();
                    return;
                }
            }
        }

        let client = client.clone();
        let self_description = self_description.clone();
        probes.spawn(async move {
            probe_register(&client, &ip, DEFAULT_SERVER_PORT, &self_description).await
        });
    }

    while let Some(result) = probes.join_next().await {
        if let Ok(Some(peer)) = result {
            found += 1;
            if events_tx.send(DiscoveryEvent::PeerSeen(peer)).await.is_err() {
                probes.abort_all();
                return;
            }
        }
    }

    tracing::info!(event = "share_http_scan_finished", found);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_addresses_should_skip_network_and_broadcast_hosts() {
        let addresses: Vec<String> = scan_addresses().collect();
        assert_eq!(addresses.len(), 4 * 254);
        assert_eq!(addresses[0], "192.168.1.1");
        assert!(!addresses.iter().any(|ip| ip.ends_with(".0")));
        assert!(!addresses.iter().any(|ip| ip.ends_with(".255")));
    }
}
