use crate::local::{self, CachedPond, LocalStorage};
use crate::models::realtime::{DeviceRecord, DeviceState, DeviceType, PondId, SensorRecord};
use crate::services::auto_mode::{AlertNotifier, AutoModeController, AutomationSettings};
use crate::services::offline_queue::OfflineQueue;
use crate::services::settings::{self, SettingsSource};
use crate::services::thresholds::{self, SensorSnapshot, Thresholds};
use crate::store::{self, RealtimeStore, StoreError, paths};
use crate::utils::now_millis;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Lost,
    Restored,
}

/// Online/offline as seen from request outcomes. Starts unknown; the first
/// observation sets the state without reporting a transition.
#[derive(Debug, Default)]
pub struct Connectivity {
    online: Option<bool>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown counts as online so the first write is attempted.
    pub fn is_online(&self) -> bool {
        self.online.unwrap_or(true)
    }

    pub fn observe(&mut self, online: bool) -> Option<Transition> {
        let previous = self.online.replace(online);
        match (previous, online) {
            (Some(false), true) => {
                info!("Realtime database reachable again");
                Some(Transition::Restored)
            }
            (Some(true), false) => {
                warn!("Realtime database unreachable; device writes will be queued");
                Some(Transition::Lost)
            }
            (None, false) => {
                warn!("Realtime database unreachable");
                None
            }
            _ => None,
        }
    }

    /// Any answer from the backend, even an error status, means it is reachable.
    pub fn observe_result<T>(&mut self, result: &Result<T, StoreError>) -> Option<Transition> {
        let online = match result {
            Ok(_) => true,
            Err(e) => !e.is_connectivity(),
        };
        self.observe(online)
    }

    /// Issue a cheap read of `path` and record whether it got through.
    pub fn probe<S: RealtimeStore + ?Sized>(&mut self, store: &S, path: &str) -> bool {
        let result = store.get(path);
        if let Err(e) = &result {
            debug!("Probe of {} failed: {}", path, e);
        }
        self.observe_result(&result);
        self.is_online()
    }
}

/// Per-pond polling state for the realtime loop.
pub struct RealtimeService {
    ponds: Vec<CachedPond>,
    thresholds: Thresholds,
    automation: AutomationSettings,
    controllers: BTreeMap<PondId, AutoModeController>,
    connectivity: Connectivity,
}

impl RealtimeService {
    pub fn new(ponds: Vec<CachedPond>, thresholds: Thresholds, automation: AutomationSettings) -> Self {
        let controllers = ponds
            .iter()
            .map(|p| (p.id.clone(), AutoModeController::new(p.id.clone())))
            .collect();
        RealtimeService {
            ponds,
            thresholds,
            automation,
            controllers,
            connectivity: Connectivity::new(),
        }
    }

    #[cfg(test)]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn connectivity_mut(&mut self) -> &mut Connectivity {
        &mut self.connectivity
    }

    #[cfg(test)]
    pub fn controller(&self, pond: &PondId) -> Option<&AutoModeController> {
        self.controllers.get(pond)
    }

    /// Pick up threshold and automation edits made while running. Changed
    /// thresholds are mirrored again; a failed read keeps the current values.
    pub fn refresh_settings<S, P>(&mut self, store: &S, source: &mut P)
    where
        S: RealtimeStore + ?Sized,
        P: SettingsSource + ?Sized,
    {
        let (thresholds, automation) = match source.load() {
            Ok(v) => v,
            Err(e) => {
                warn!("Settings refresh failed, keeping current values: {}", e);
                return;
            }
        };
        if thresholds != self.thresholds {
            info!("Thresholds changed: {:?}", thresholds);
            let ids: Vec<PondId> = self.ponds.iter().map(|p| p.id.clone()).collect();
            settings::mirror_thresholds(store, &ids, &thresholds);
            self.thresholds = thresholds;
        }
        if automation != self.automation {
            info!(
                "Automation changed: auto_mode={}, alerts={}",
                automation.auto_mode_enabled, automation.alerts_enabled
            );
            self.automation = automation;
        }
    }

    /// Poll every pond once.
    pub fn tick<S, L>(&mut self, store: &S, queue: &mut OfflineQueue<L>)
    where
        S: RealtimeStore + ?Sized,
        L: LocalStorage,
    {
        for pond in &self.ponds {
            let sensors = store::read::<SensorRecord, _>(store, &paths::sensors(&pond.id));
            if self.connectivity.observe_result(&sensors) == Some(Transition::Restored) {
                queue.flush(store);
            }
            let sensors = match sensors {
                Ok(s) => s,
                Err(e) if e.is_connectivity() => continue,
                Err(e) => {
                    warn!("Pond {}: unreadable sensors: {}", pond.id, e);
                    None
                }
            };

            let devices = match read_devices(store, &pond.id) {
                Ok(d) => d,
                Err(e) => {
                    self.connectivity.observe_result::<()>(&Err(e.clone()));
                    warn!("Pond {}: reading devices failed: {}", pond.id, e);
                    continue;
                }
            };
            local::remember_pond_devices(queue.storage(), &pond.id, &devices, now_millis());

            let snapshot = match sensors.as_ref().and_then(SensorSnapshot::from_record) {
                Some(s) if s.is_valid() => s,
                Some(s) => {
                    debug!("Pond {}: skipping evaluation of implausible reading {:?}", pond.id, s);
                    continue;
                }
                None => {
                    debug!("Pond {}: no complete sensor reading yet", pond.id);
                    continue;
                }
            };

            let conditions = thresholds::evaluate(&snapshot, &self.thresholds);
            let Some(controller) = self.controllers.get_mut(&pond.id) else { continue };
            let mut notifier = AlertNotifier::new(store);
            let outcome = controller.process(&conditions, &devices, &self.automation, store, &mut notifier);
            if !outcome.activated.is_empty() || !outcome.reverted.is_empty() {
                info!(
                    "Pond {}: auto mode activated {:?}, reverted {:?}",
                    pond.id, outcome.activated, outcome.reverted
                );
            }
        }
    }
}

/// Current device states of a pond; unknown device types are skipped.
pub fn read_devices<S: RealtimeStore + ?Sized>(
    store: &S,
    pond: &PondId,
) -> Result<BTreeMap<DeviceType, DeviceState>, StoreError> {
    let raw: BTreeMap<String, DeviceRecord> = store::read(store, &paths::devices(pond))?.unwrap_or_default();
    Ok(raw
        .iter()
        .filter_map(|(k, v)| k.parse::<DeviceType>().ok().map(|t| (t, DeviceState::from(v))))
        .collect())
}

pub fn run_loop<S, L, P>(
    store: &S,
    queue: &mut OfflineQueue<L>,
    service: &mut RealtimeService,
    settings: &mut P,
    interval: Duration,
) -> Result<(), String>
where
    S: RealtimeStore + ?Sized,
    L: LocalStorage,
    P: SettingsSource + ?Sized,
{
    loop {
        let tick_start = Instant::now();

        service.refresh_settings(store, settings);
        service.tick(store, queue);

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}
