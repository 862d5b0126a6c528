//! Manual device writes that could not reach the backend.
//!
//! One slot per device: queueing a toggle for a device that already has an
//! unsent one replaces it (last write wins, no FIFO). The queue is mirrored to
//! local storage after every change so it survives restarts, and re-read
//! before every change because separate CLI invocations queue into the same
//! storage as the running service. `flush` is driven
//! from outside (startup and connectivity-restored); there is no timer and no
//! backoff.

use crate::local::{self, LocalStorage, PENDING_ACTIONS_KEY};
use crate::models::realtime::{DeviceKey, DeviceState};
use crate::store::{self, RealtimeStore};
use crate::utils::now_millis;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub device_id: DeviceKey,
    /// Requested manual state: `true` = on.
    pub value: bool,
    pub timestamp: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub replayed: usize,
    pub failed: usize,
}

pub struct OfflineQueue<L: LocalStorage> {
    storage: L,
    pending: BTreeMap<DeviceKey, PendingAction>,
    /// False while the last persist failed; memory then holds actions the
    /// storage does not.
    in_sync: bool,
}

fn newest_per_device(actions: impl IntoIterator<Item = PendingAction>) -> BTreeMap<DeviceKey, PendingAction> {
    let mut pending: BTreeMap<DeviceKey, PendingAction> = BTreeMap::new();
    for action in actions {
        match pending.get(&action.device_id) {
            Some(existing) if existing.timestamp > action.timestamp => {}
            _ => {
                pending.insert(action.device_id.clone(), action);
            }
        }
    }
    pending
}

fn read_stored<L: LocalStorage>(storage: &L) -> Option<BTreeMap<DeviceKey, PendingAction>> {
    let stored: Vec<PendingAction> = local::load_json(storage, PENDING_ACTIONS_KEY)?;
    Some(newest_per_device(stored))
}

impl<L: LocalStorage> OfflineQueue<L> {
    /// Restore the queue from local storage. A missing or unreadable queue
    /// starts empty.
    pub fn load(storage: L) -> Self {
        let pending = read_stored(&storage).unwrap_or_default();
        if !pending.is_empty() {
            info!("Offline queue: restored {} pending action(s)", pending.len());
        }
        OfflineQueue {
            storage,
            pending,
            in_sync: true,
        }
    }

    pub fn storage(&self) -> &L {
        &self.storage
    }

    /// Counts as of the last load, change or flush.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, device: &DeviceKey) -> Option<&PendingAction> {
        self.pending.get(device)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.values()
    }

    /// Re-read the stored queue. Other processes (`pondkeeper toggle`) share
    /// the same storage, so it is the source of truth before every change.
    pub fn refresh(&mut self) {
        let Some(stored) = read_stored(&self.storage) else { return };
        if self.in_sync {
            self.pending = stored;
        } else {
            let unsaved = std::mem::take(&mut self.pending);
            self.pending = newest_per_device(stored.into_values().chain(unsaved.into_values()));
        }
    }

    /// Queue a manual on/off for `device`, replacing any unsent one.
    pub fn enqueue(&mut self, device: DeviceKey, value: bool) -> &PendingAction {
        self.refresh();
        let action = PendingAction {
            id: format!("{:016x}", rand::random::<u64>()),
            device_id: device.clone(),
            value,
            timestamp: now_millis(),
        };
        if let Some(old) = self.pending.insert(device.clone(), action) {
            debug!(
                "Offline queue: {} superseded pending {} (value={})",
                device, old.id, old.value
            );
        }
        info!(
            "Offline queue: queued {} -> {} ({} pending)",
            device,
            if value { "on" } else { "off" },
            self.pending.len()
        );
        self.persist();
        &self.pending[&device]
    }

    /// Drop the unsent action for `device`, if any. Used once a newer write
    /// for the same device reached the backend directly.
    pub fn discard(&mut self, device: &DeviceKey) -> Option<PendingAction> {
        self.refresh();
        let removed = self.pending.remove(device);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Replay every pending write. Entries are dropped only once their write
    /// succeeded; failures stay for the next flush. An action superseded in
    /// storage while its write was in flight is kept.
    pub fn flush<S: RealtimeStore + ?Sized>(&mut self, store: &S) -> FlushReport {
        self.refresh();
        let mut report = FlushReport::default();
        if self.pending.is_empty() {
            return report;
        }

        let mut replayed: Vec<(DeviceKey, String)> = Vec::new();
        for (key, action) in &self.pending {
            let state = DeviceState::manual(action.value);
            match store::write_device(store, &key.pond_id, key.device_type, state) {
                Ok(()) => {
                    local::remember_device(&self.storage, key.clone(), state, now_millis());
                    replayed.push((key.clone(), action.id.clone()));
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!("Offline queue: replaying {} failed, keeping it: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        if !replayed.is_empty() {
            self.refresh();
            for (key, id) in replayed {
                if self.pending.get(&key).is_some_and(|a| a.id == id) {
                    self.pending.remove(&key);
                }
            }
            self.persist();
        }
        info!(
            "Offline queue: flushed {} action(s), {} still pending",
            report.replayed,
            self.pending.len()
        );
        report
    }

    fn persist(&mut self) {
        let actions: Vec<&PendingAction> = self.pending.values().collect();
        let written = serde_json::to_string(&actions)
            .map_err(|e| format!("cannot serialize {}: {}", PENDING_ACTIONS_KEY, e))
            .and_then(|raw| self.storage.write(PENDING_ACTIONS_KEY, &raw));
        if let Err(e) = &written {
            warn!("Offline queue: {}; keeping actions in memory", e);
        }
        self.in_sync = written.is_ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FileStorage;
    use crate::local::memory::MemoryStorage;
    use crate::models::realtime::{DeviceType, PondId};
    use crate::store::StoreError;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn key(pond: &str, device: DeviceType) -> DeviceKey {
        DeviceKey::new(PondId(pond.to_string()), device)
    }

    #[test]
    fn second_enqueue_for_a_device_wins() {
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        let first_id = queue.enqueue(key("a", DeviceType::Pump), true).id.clone();
        let second_id = queue.enqueue(key("a", DeviceType::Pump), false).id.clone();
        assert_ne!(first_id, second_id);
        assert_eq!(queue.len(), 1);

        let store = MemoryStore::new();
        let report = queue.flush(&store);
        assert_eq!(report, FlushReport { replayed: 1, failed: 0 });
        assert_eq!(store.writes(), vec![(
            "ponds/a/devices/pump".to_string(),
            json!({ "state": 0, "mode": "manual" })
        )]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_keeps_only_the_failed_entry() {
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        queue.enqueue(key("a", DeviceType::Pump), true);
        queue.enqueue(key("a", DeviceType::Light), true);

        let store = MemoryStore::new();
        store.fail_writes_under("ponds/a/devices/light", StoreError::Transport("reset by peer".into()));

        let report = queue.flush(&store);
        assert_eq!(report, FlushReport { replayed: 1, failed: 1 });
        let left: Vec<_> = queue.pending().map(|a| a.device_id.clone()).collect();
        assert_eq!(left, vec![key("a", DeviceType::Light)]);

        store.heal();
        assert_eq!(queue.flush(&store), FlushReport { replayed: 1, failed: 0 });
        assert!(queue.is_empty());
        assert_eq!(store.value_at("ponds/a/devices/light/state"), json!(1));
    }

    #[test]
    fn queue_survives_reload() {
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        queue.enqueue(key("a", DeviceType::Aerator), true);
        queue.enqueue(key("b", DeviceType::Camera), false);

        let raw = queue.storage().raw(PENDING_ACTIONS_KEY).expect("persisted");
        assert!(raw.contains("\"deviceId\":\"a/aerator\""), "{raw}");

        let storage = MemoryStorage::new();
        storage.write(PENDING_ACTIONS_KEY, &raw).expect("writable");
        let restored = OfflineQueue::load(storage);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(&key("a", DeviceType::Aerator)).map(|a| a.value), Some(true));
    }

    #[test]
    fn load_keeps_newest_duplicate() {
        let storage = MemoryStorage::new();
        let stored = json!([
            { "id": "1", "deviceId": "a/pump", "value": true, "timestamp": 200 },
            { "id": "2", "deviceId": "a/pump", "value": false, "timestamp": 100 }
        ]);
        storage.write(PENDING_ACTIONS_KEY, &stored.to_string()).expect("writable");

        let queue = OfflineQueue::load(storage);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(&key("a", DeviceType::Pump)).map(|a| a.id.as_str()), Some("1"));
    }

    #[test]
    fn unwritable_storage_still_queues_in_memory() {
        let storage = MemoryStorage::new();
        storage.set_read_only(true);
        let mut queue = OfflineQueue::load(storage);
        queue.enqueue(key("a", DeviceType::Pump), true);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn replayed_actions_update_the_device_cache() {
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        queue.enqueue(key("a", DeviceType::Pump), true);
        queue.flush(&MemoryStore::new());

        let cached = local::cached_devices(queue.storage(), &PondId("a".into()));
        assert_eq!(cached[&DeviceType::Pump].state, DeviceState::ManualOn);
    }

    #[test]
    fn offline_flush_changes_nothing() {
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        queue.enqueue(key("a", DeviceType::Pump), true);
        let store = MemoryStore::new();
        store.set_offline(true);

        assert_eq!(queue.flush(&store), FlushReport { replayed: 0, failed: 1 });
        assert_eq!(queue.len(), 1);
    }

    fn shared_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "pondkeeper-queue-{}-{}-{:08x}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    #[test]
    fn flush_replays_actions_queued_by_another_process() {
        let dir = shared_dir("flush");
        let mut service = OfflineQueue::load(FileStorage::new(&dir));
        service.enqueue(key("a", DeviceType::Pump), true);

        let mut cli = OfflineQueue::load(FileStorage::new(&dir));
        cli.enqueue(key("a", DeviceType::Light), true);
        assert_eq!(cli.len(), 2);

        let store = MemoryStore::new();
        let report = service.flush(&store);
        assert_eq!(report, FlushReport { replayed: 2, failed: 0 });
        assert_eq!(store.value_at("ponds/a/devices/light/state"), json!(1));
        assert_eq!(store.value_at("ponds/a/devices/pump/state"), json!(1));
        assert!(OfflineQueue::load(FileStorage::new(&dir)).is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn action_discarded_elsewhere_is_not_replayed() {
        let dir = shared_dir("discard");
        let mut service = OfflineQueue::load(FileStorage::new(&dir));
        service.enqueue(key("a", DeviceType::Pump), true);

        let mut cli = OfflineQueue::load(FileStorage::new(&dir));
        assert!(cli.discard(&key("a", DeviceType::Pump)).is_some());

        let store = MemoryStore::new();
        assert_eq!(service.flush(&store), FlushReport::default());
        assert!(store.writes().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn enqueue_keeps_entries_written_by_another_process() {
        let dir = shared_dir("enqueue");
        let mut service = OfflineQueue::load(FileStorage::new(&dir));
        let mut cli = OfflineQueue::load(FileStorage::new(&dir));

        cli.enqueue(key("a", DeviceType::Camera), false);
        service.enqueue(key("a", DeviceType::Aerator), true);

        let reloaded = OfflineQueue::load(FileStorage::new(&dir));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&key("a", DeviceType::Camera)).map(|a| a.value), Some(false));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
