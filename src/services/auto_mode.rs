//! Auto mode: react to threshold conditions by switching devices.
//!
//! Per device the controller distinguishes manual-off, manual-on and auto-on
//! (`DeviceState`). It only ever moves a device manual-off -> auto-on when a
//! new condition asks for it, and auto-on -> manual-off when every condition
//! has cleared. Devices an operator switched on are left alone.
//!
//! Writes are fire-and-forget. A failed write is logged and not retried, and
//! the tracking set is not rolled back: if the revert write fails the device
//! stays auto-on while the controller has already forgotten it.

use crate::models::realtime::{AlertRecord, DeviceState, DeviceType, PondId};
use crate::services::thresholds::{Condition, ConditionKind};
use crate::store::{self, RealtimeStore};
use crate::utils::now_millis;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationSettings {
    pub auto_mode_enabled: bool,
    pub alerts_enabled: bool,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        AutomationSettings {
            auto_mode_enabled: true,
            alerts_enabled: true,
        }
    }
}

/// Where user-facing notifications go.
pub trait Notifier {
    fn notify(&mut self, pond: &PondId, condition: &Condition);
}

/// Logs the condition and records it under `ponds/{pondId}/alerts`.
pub struct AlertNotifier<'a, S: RealtimeStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RealtimeStore + ?Sized> AlertNotifier<'a, S> {
    pub fn new(store: &'a S) -> Self {
        AlertNotifier { store }
    }
}

impl<S: RealtimeStore + ?Sized> Notifier for AlertNotifier<'_, S> {
    fn notify(&mut self, pond: &PondId, condition: &Condition) {
        warn!(
            "Pond {}: {} [{}]",
            pond,
            condition.message,
            condition.severity.as_str()
        );
        let alert = AlertRecord {
            kind: condition.kind.as_str().to_string(),
            severity: condition.severity.as_str().to_string(),
            message: condition.message.clone(),
            timestamp: now_millis(),
            resolved: false,
        };
        let value = match serde_json::to_value(&alert) {
            Ok(v) => v,
            Err(e) => {
                error!("Pond {}: cannot encode alert: {}", pond, e);
                return;
            }
        };
        if let Err(e) = self.store.push(&store::paths::alerts(pond), &value) {
            error!("Pond {}: recording alert {} failed: {}", pond, alert.kind, e);
        }
    }
}

/// What one `process` call did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub notified: Vec<ConditionKind>,
    pub activated: Vec<DeviceType>,
    pub reverted: Vec<DeviceType>,
}

/// Auto mode state for one pond. Feed it every evaluation in order.
#[derive(Debug)]
pub struct AutoModeController {
    pond: PondId,
    previous: BTreeSet<ConditionKind>,
    /// Devices this controller switched to auto-on and has not reverted yet.
    auto_activated: BTreeSet<DeviceType>,
}

impl AutoModeController {
    pub fn new(pond: PondId) -> Self {
        AutoModeController {
            pond,
            previous: BTreeSet::new(),
            auto_activated: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub fn auto_activated(&self) -> &BTreeSet<DeviceType> {
        &self.auto_activated
    }

    /// Handle one evaluation.
    ///
    /// `devices` is the current state of the pond's devices; absent devices
    /// count as manual-off.
    pub fn process<S, N>(
        &mut self,
        conditions: &[Condition],
        devices: &BTreeMap<DeviceType, DeviceState>,
        settings: &AutomationSettings,
        store: &S,
        notifier: &mut N,
    ) -> Outcome
    where
        S: RealtimeStore + ?Sized,
        N: Notifier + ?Sized,
    {
        let current: BTreeSet<ConditionKind> = conditions.iter().map(|c| c.kind).collect();
        let mut outcome = Outcome::default();

        if settings.auto_mode_enabled && settings.alerts_enabled {
            for condition in conditions.iter().filter(|c| !self.previous.contains(&c.kind)) {
                notifier.notify(&self.pond, condition);
                outcome.notified.push(condition.kind);

                let Some(action) = condition.action else { continue };
                if self.auto_activated.contains(&action.device) {
                    continue;
                }
                let state = devices.get(&action.device).copied().unwrap_or(DeviceState::ManualOff);
                if state.is_on() {
                    debug!(
                        "Pond {}: {} already on ({:?}); not taking it over",
                        self.pond, action.device, state
                    );
                    continue;
                }

                info!(
                    "Pond {}: auto mode switching {} on ({})",
                    self.pond,
                    action.device,
                    condition.kind.as_str()
                );
                self.auto_activated.insert(action.device);
                outcome.activated.push(action.device);
                if let Err(e) = store::write_device(store, &self.pond, action.device, DeviceState::AutoOn) {
                    error!("Pond {}: switching {} on failed: {}", self.pond, action.device, e);
                }
            }
        }

        if current.is_empty() && !self.previous.is_empty() {
            let tracked = std::mem::take(&mut self.auto_activated);
            if !tracked.is_empty() {
                info!("Pond {}: all conditions cleared, reverting {} device(s)", self.pond, tracked.len());
            }
            for device in tracked {
                outcome.reverted.push(device);
                if let Err(e) = store::write_device(store, &self.pond, device, DeviceState::ManualOff) {
                    error!(
                        "Pond {}: switching {} off failed, it stays auto-on untracked: {}",
                        self.pond, device, e
                    );
                }
            }
        }

        self.previous = current;
        outcome
    }
}
