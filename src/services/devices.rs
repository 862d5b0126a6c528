//! Operator-initiated device writes.

use crate::local::{self, LocalStorage};
use crate::models::realtime::{DeviceKey, DeviceState};
use crate::services::offline_queue::OfflineQueue;
use crate::store::{self, RealtimeStore, StoreError, paths};
use crate::utils::now_millis;
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// How long a command waits for the pond controller's `ack` echo.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Written,
    /// Backend unreachable; the write waits in the offline queue.
    Queued,
}

/// Manually switch a device. When the backend is known to be offline, or the
/// write fails for connectivity reasons, the toggle is queued instead.
pub fn toggle<S, L>(
    store: &S,
    queue: &mut OfflineQueue<L>,
    online: bool,
    device: DeviceKey,
    on: bool,
) -> Result<ToggleOutcome, String>
where
    S: RealtimeStore + ?Sized,
    L: LocalStorage,
{
    if !online {
        queue.enqueue(device, on);
        return Ok(ToggleOutcome::Queued);
    }

    let state = DeviceState::manual(on);
    match store::write_device(store, &device.pond_id, device.device_type, state) {
        Ok(()) => {
            info!("Switched {} {}", device, if on { "on" } else { "off" });
            if queue.discard(&device).is_some() {
                debug!("Dropped older queued action for {}", device);
            }
            local::remember_device(queue.storage(), device, state, now_millis());
            Ok(ToggleOutcome::Written)
        }
        Err(e) if e.is_connectivity() => {
            warn!("Backend unreachable while switching {}: {}; queueing", device, e);
            queue.enqueue(device, on);
            Ok(ToggleOutcome::Queued)
        }
        Err(e) => Err(format!("switching {} failed: {}", device, e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged { after: Duration },
    /// No echo in time; the command is still considered sent.
    TimedOut,
}

/// Manually switch a device, then wait for the controller to echo an `ack`
/// timestamp no older than the write.
pub fn send_with_ack<S: RealtimeStore + ?Sized>(
    store: &S,
    device: &DeviceKey,
    on: bool,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<AckOutcome, StoreError> {
    let sent_at = now_millis();
    store::write_device(store, &device.pond_id, device.device_type, DeviceState::manual(on))?;

    let ack_path = paths::device_ack(&device.pond_id, device.device_type);
    let start = Instant::now();
    loop {
        match store::read::<i64, _>(store, &ack_path) {
            Ok(Some(ack)) if ack >= sent_at => {
                let after = start.elapsed();
                info!("{} acknowledged after {} ms", device, after.as_millis());
                return Ok(AckOutcome::Acknowledged { after });
            }
            Ok(_) => {}
            Err(e) => debug!("Reading ack for {} failed: {}", device, e),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            warn!(
                "{} not acknowledged within {} ms; treating command as sent",
                device,
                timeout.as_millis()
            );
            return Ok(AckOutcome::TimedOut);
        }
        thread::sleep(poll_interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::memory::MemoryStorage;
    use crate::models::realtime::{DeviceType, PondId};
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn pump() -> DeviceKey {
        DeviceKey::new(PondId("a".to_string()), DeviceType::Pump)
    }

    #[test]
    fn online_toggle_writes_and_caches() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::load(MemoryStorage::new());

        let out = toggle(&store, &mut queue, true, pump(), true).expect("toggle");
        assert_eq!(out, ToggleOutcome::Written);
        assert_eq!(store.value_at("ponds/a/devices/pump"), json!({ "state": 1, "mode": "manual" }));
        assert!(queue.is_empty());
        let cached = local::cached_devices(queue.storage(), &PondId("a".into()));
        assert_eq!(cached[&DeviceType::Pump].state, DeviceState::ManualOn);
    }

    #[test]
    fn known_offline_toggle_is_queued_without_a_request() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::load(MemoryStorage::new());

        let out = toggle(&store, &mut queue, false, pump(), true).expect("toggle");
        assert_eq!(out, ToggleOutcome::Queued);
        assert!(store.writes().is_empty());
        assert_eq!(queue.get(&pump()).map(|a| a.value), Some(true));
    }

    #[test]
    fn unreachable_backend_queues_the_toggle() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let mut queue = OfflineQueue::load(MemoryStorage::new());

        let out = toggle(&store, &mut queue, true, pump(), false).expect("toggle");
        assert_eq!(out, ToggleOutcome::Queued);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejected_write_is_an_error_not_queued() {
        let store = MemoryStore::new();
        store.fail_writes_under("ponds/a", StoreError::Http { status: 401, message: "Permission denied".into() });
        let mut queue = OfflineQueue::load(MemoryStorage::new());

        let err = toggle(&store, &mut queue, true, pump(), true).unwrap_err();
        assert!(err.contains("Permission denied"), "{err}");
        assert!(queue.is_empty());
    }

    #[test]
    fn direct_write_supersedes_queued_action() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::load(MemoryStorage::new());
        toggle(&store, &mut queue, false, pump(), true).expect("queued");

        toggle(&store, &mut queue, true, pump(), false).expect("written");
        assert!(queue.is_empty(), "stale queued 'on' must not replay later");
    }

    #[test]
    fn ack_newer_than_the_write_completes_the_command() {
        let store = MemoryStore::new().with("ponds/a/devices/pump/ack", json!(i64::MAX));
        let out = send_with_ack(&store, &pump(), true, ACK_TIMEOUT, ACK_POLL_INTERVAL).expect("sent");
        assert!(matches!(out, AckOutcome::Acknowledged { .. }));
    }

    #[test]
    fn stale_ack_times_out_but_command_is_sent() {
        let store = MemoryStore::new().with("ponds/a/devices/pump/ack", json!(1));
        let out = send_with_ack(&store, &pump(), true, Duration::from_millis(30), Duration::from_millis(5))
            .expect("sent");
        assert_eq!(out, AckOutcome::TimedOut);
        assert_eq!(store.value_at("ponds/a/devices/pump/state"), json!(1));
    }

    #[test]
    fn failed_command_write_is_reported() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = send_with_ack(&store, &pump(), true, ACK_TIMEOUT, ACK_POLL_INTERVAL).unwrap_err();
        assert!(err.is_connectivity());
    }
}
