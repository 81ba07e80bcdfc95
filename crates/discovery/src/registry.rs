use std::sync::RwLock;

use protocol::keys;
use protocol::models::PeerDeviceDto;

fn read_lock<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "share_lock_poisoned", lock = name, access = "read");
            poisoned.into_inner()
        }
    }
}

fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    name: &'static str,
) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(event = "share_lock_poisoned", lock = name, access = "write");
            poisoned.into_inner()
        }
    }
}

/// In-memory table of known peers keyed by fingerprint.
///
/// Insertion order is preserved so the UI sees a stable list. Peers are never
/// hard-deleted by the timeout sweep; they only go offline.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<PeerDeviceDto>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge-or-insert by fingerprint. Every sighting refreshes `lastSeen`
    /// and forces the peer back online.
    pub fn upsert(&self, mut device: PeerDeviceDto, now: i64) {
        device.last_seen = now;
        device.is_online = true;

        let mut devices = write_lock(&self.devices, "devices");
        match devices
            .iter_mut()
            .find(|entry| entry.fingerprint == device.fingerprint)
        {
            Some(entry) => *entry = device,
            None => devices.push(device),
        }
    }

    pub fn mark_offline(&self, fingerprint: &str) -> bool {
        let mut devices = write_lock(&self.devices, "devices");
        match devices
            .iter_mut()
            .find(|entry| entry.fingerprint == fingerprint)
        {
            Some(entry) => {
                entry.is_online = false;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, fingerprint: &str) -> bool {
        let mut devices = write_lock(&self.devices, "devices");
        let before = devices.len();
        devices.retain(|entry| entry.fingerprint != fingerprint);
        devices.len() != before
    }

    pub fn clear(&self) {
        write_lock(&self.devices, "devices").clear();
    }

    pub fn get(&self, fingerprint: &str) -> Option<PeerDeviceDto> {
        read_lock(&self.devices, "devices")
            .iter()
            .find(|entry| entry.fingerprint == fingerprint)
            .cloned()
    }

    /// Snapshot in insertion order.
    pub fn list(&self) -> Vec<PeerDeviceDto> {
        read_lock(&self.devices, "devices").clone()
    }

    /// Resolves a connection key against already-discovered peers. This is a
    /// lookup, not a network scan.
    pub fn find_by_key(&self, key: &str) -> Option<PeerDeviceDto> {
        read_lock(&self.devices, "devices")
            .iter()
            .find(|entry| keys::key_matches(key, &entry.fingerprint))
            .cloned()
    }

    /// Marks every peer silent for longer than `timeout_ms` offline. Safe to
    /// call repeatedly; already-offline peers stay offline and are kept.
    pub fn sweep_timeouts(&self, now: i64, timeout_ms: i64) -> usize {
        let mut marked = 0;
        let mut devices = write_lock(&self.devices, "devices");
        for entry in devices.iter_mut() {
            if entry.is_online && now - entry.last_seen > timeout_ms {
                entry.is_online = false;
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::models::{DeviceKind, DeviceProtocol};

    fn peer(fingerprint: &str, alias: &str) -> PeerDeviceDto {
        PeerDeviceDto {
            fingerprint: fingerprint.to_string(),
            alias: alias.to_string(),
            device_type: DeviceKind::Mobile,
            device_model: None,
            ip_address: "192.168.1.20".to_string(),
            port: 53317,
            protocol: DeviceProtocol::Http,
            version: "2.0".to_string(),
            last_seen: 0,
            is_online: true,
        }
    }

    #[test]
    fn upsert_should_merge_by_fingerprint_and_keep_order() {
        let registry = DeviceRegistry::new();
        registry.upsert(peer("aaaa", "first"), 1);
        registry.upsert(peer("bbbb", "second"), 2);
        registry.upsert(peer("aaaa", "renamed"), 3);

        let devices = registry.list();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].fingerprint, "aaaa");
        assert_eq!(devices[0].alias, "renamed");
        assert_eq!(devices[0].last_seen, 3);
        assert_eq!(devices[1].fingerprint, "bbbb");
    }

    #[test]
    fn upsert_should_revive_offline_peers() {
        let registry = DeviceRegistry::new();
        registry.upsert(peer("aaaa", "first"), 1);
        registry.mark_offline("aaaa");
        assert!(!registry.get("aaaa").expect("peer present").is_online);

        registry.upsert(peer("aaaa", "first"), 10);
        assert!(registry.get("aaaa").expect("peer present").is_online);
    }

    #[test]
    fn sweep_timeouts_should_be_idempotent_and_never_remove() {
        let registry = DeviceRegistry::new();
        registry.upsert(peer("aaaa", "stale"), 0);
        registry.upsert(peer("bbbb", "fresh"), 29_000);

        assert_eq!(registry.sweep_timeouts(30_001, 30_000), 1);
        assert_eq!(registry.sweep_timeouts(30_001, 30_000), 0);
        assert_eq!(registry.sweep_timeouts(30_002, 30_000), 0);

        let devices = registry.list();
        assert_eq!(devices.len(), 2);
        assert!(!devices[0].is_online);
        assert!(devices[1].is_online);
    }

    #[test]
    fn find_by_key_should_match_normalized_input() {
        let registry = DeviceRegistry::new();
        registry.upsert(peer("a7f39b2e44556677", "phone"), 1);

        let found = registry.find_by_key("a7f3 9b2e").expect("match");
        assert_eq!(found.fingerprint, "a7f39b2e44556677");
        assert!(registry.find_by_key("FFFF-0000").is_none());
    }

    #[test]
    fn remove_should_drop_only_target() {
        let registry = DeviceRegistry::new();
        registry.upsert(peer("aaaa", "first"), 1);
        registry.upsert(peer("bbbb", "second"), 1);

        assert!(registry.remove("aaaa"));
        assert!(!registry.remove("aaaa"));
        assert_eq!(registry.list().len(), 1);
    }
}
