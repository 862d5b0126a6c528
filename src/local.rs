//! Best-effort local storage: device cache, pending-action queue, ponds cache.
//!
//! Everything is JSON under a small set of keys. Failures are logged and
//! swallowed; callers fall back to empty state.

use crate::models::realtime::{DeviceKey, DeviceState, DeviceType, PondId};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const DEVICE_CACHE_KEY: &str = "device_cache";
pub const PENDING_ACTIONS_KEY: &str = "pending_actions";
pub const PONDS_CACHE_KEY: &str = "ponds_cache";

pub trait LocalStorage {
    /// `None` when the key was never written or cannot be read.
    fn read(&self, key: &str) -> Option<String>;

    fn write(&self, key: &str, contents: &str) -> Result<(), String>;
}

/// One `<key>.json` file per key inside `dir`.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl LocalStorage for FileStorage {
    fn read(&self, key: &str) -> Option<String> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("local storage: {} unreadable: {}", path.display(), e);
                None
            }
        }
    }

    fn write(&self, key: &str, contents: &str) -> Result<(), String> {
        fs::create_dir_all(&self.dir).map_err(|e| format!("create {} failed: {}", self.dir.display(), e))?;
        let path = self.path(key);
        // write-then-rename keeps the previous file intact if we die mid-write
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|e| format!("write {} failed: {}", tmp.display(), e))?;
        fs::rename(&tmp, &path).map_err(|e| format!("rename to {} failed: {}", path.display(), e))
    }
}

pub fn load_json<T: DeserializeOwned, L: LocalStorage + ?Sized>(storage: &L, key: &str) -> Option<T> {
    let raw = storage.read(key)?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("local storage: discarding unparsable {}: {}", key, e);
            None
        }
    }
}

pub fn save_json<T: Serialize + ?Sized, L: LocalStorage + ?Sized>(storage: &L, key: &str, value: &T) {
    let raw = match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            warn!("local storage: cannot serialize {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = storage.write(key, &raw) {
        warn!("local storage: {}", e);
    }
}

// =====================
// Device cache
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDevice {
    pub state: DeviceState,
    pub updated_at: i64,
}

pub fn remember_device<L: LocalStorage + ?Sized>(storage: &L, key: DeviceKey, state: DeviceState, at: i64) {
    let mut cache: BTreeMap<DeviceKey, CachedDevice> = load_json(storage, DEVICE_CACHE_KEY).unwrap_or_default();
    cache.insert(key, CachedDevice { state, updated_at: at });
    save_json(storage, DEVICE_CACHE_KEY, &cache);
}

/// Replace every cached device of `pond` at once (used after a full read).
pub fn remember_pond_devices<L: LocalStorage + ?Sized>(
    storage: &L,
    pond: &PondId,
    devices: &BTreeMap<DeviceType, DeviceState>,
    at: i64,
) {
    let mut cache: BTreeMap<DeviceKey, CachedDevice> = load_json(storage, DEVICE_CACHE_KEY).unwrap_or_default();
    cache.retain(|k, _| &k.pond_id != pond);
    for (device, state) in devices {
        cache.insert(
            DeviceKey::new(pond.clone(), *device),
            CachedDevice {
                state: *state,
                updated_at: at,
            },
        );
    }
    save_json(storage, DEVICE_CACHE_KEY, &cache);
}

pub fn cached_devices<L: LocalStorage + ?Sized>(storage: &L, pond: &PondId) -> BTreeMap<DeviceType, CachedDevice> {
    let cache: BTreeMap<DeviceKey, CachedDevice> = load_json(storage, DEVICE_CACHE_KEY).unwrap_or_default();
    cache
        .into_iter()
        .filter(|(k, _)| &k.pond_id == pond)
        .map(|(k, v)| (k.device_type, v))
        .collect()
}

// =====================
// Ponds cache
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPond {
    pub id: PondId,
    pub name: String,
}

pub fn remember_ponds<L: LocalStorage + ?Sized>(storage: &L, ponds: &[CachedPond]) {
    save_json(storage, PONDS_CACHE_KEY, ponds);
}

pub fn cached_ponds<L: LocalStorage + ?Sized>(storage: &L) -> Vec<CachedPond> {
    load_json(storage, PONDS_CACHE_KEY).unwrap_or_default()
}

#[cfg(test)]
pub mod memory {
    use super::LocalStorage;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct MemoryStorage {
        entries: RefCell<BTreeMap<String, String>>,
        read_only: Cell<bool>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_read_only(&self, read_only: bool) {
            self.read_only.set(read_only);
        }

        pub fn raw(&self, key: &str) -> Option<String> {
            self.entries.borrow().get(key).cloned()
        }
    }

    impl LocalStorage for MemoryStorage {
        fn read(&self, key: &str) -> Option<String> {
            self.raw(key)
        }

        fn write(&self, key: &str, contents: &str) -> Result<(), String> {
            if self.read_only.get() {
                return Err(format!("{} is read-only", key));
            }
            self.entries.borrow_mut().insert(key.to_string(), contents.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStorage;
    use super::*;

    fn pond(id: &str) -> PondId {
        PondId(id.to_string())
    }

    #[test]
    fn device_cache_keeps_latest_state_per_device() {
        let storage = MemoryStorage::new();
        let key = DeviceKey::new(pond("a"), DeviceType::Pump);
        remember_device(&storage, key.clone(), DeviceState::ManualOn, 10);
        remember_device(&storage, key, DeviceState::ManualOff, 20);
        remember_device(&storage, DeviceKey::new(pond("b"), DeviceType::Pump), DeviceState::AutoOn, 30);

        let a = cached_devices(&storage, &pond("a"));
        assert_eq!(a.len(), 1);
        assert_eq!(a[&DeviceType::Pump], CachedDevice { state: DeviceState::ManualOff, updated_at: 20 });

        let raw = storage.raw(DEVICE_CACHE_KEY).expect("cache written");
        assert!(raw.contains("\"a/pump\""), "keys are device ids: {raw}");
    }

    #[test]
    fn pond_refresh_drops_devices_that_disappeared() {
        let storage = MemoryStorage::new();
        remember_device(&storage, DeviceKey::new(pond("a"), DeviceType::Camera), DeviceState::ManualOn, 1);

        let mut now = BTreeMap::new();
        now.insert(DeviceType::Aerator, DeviceState::AutoOn);
        remember_pond_devices(&storage, &pond("a"), &now, 2);

        let a = cached_devices(&storage, &pond("a"));
        assert_eq!(a.keys().copied().collect::<Vec<_>>(), vec![DeviceType::Aerator]);
    }

    #[test]
    fn failures_are_swallowed() {
        let storage = MemoryStorage::new();
        storage.set_read_only(true);
        remember_ponds(&storage, &[CachedPond { id: pond("a"), name: "A".into() }]);
        assert!(cached_ponds(&storage).is_empty());

        let garbage = MemoryStorage::new();
        garbage.write(PONDS_CACHE_KEY, "{not json").expect("writable");
        assert!(cached_ponds(&garbage).is_empty());
    }

    #[test]
    fn file_storage_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("pondkeeper-local-{}", std::process::id()));
        let storage = FileStorage::new(&dir);
        assert!(storage.read("missing").is_none());

        let ponds = vec![CachedPond { id: pond("a"), name: "North".into() }];
        remember_ponds(&storage, &ponds);
        assert_eq!(cached_ponds(&storage), ponds);

        let _ = fs::remove_dir_all(&dir);
    }
}
