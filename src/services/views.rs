//! Pond status view-models: pure mappings from raw records to what the
//! `status` command prints.

use crate::local::CachedDevice;
use crate::models::realtime::{DeviceRecord, DeviceState, DeviceType, PondId, PondNode, SensorRecord};
use crate::services::thresholds::{self, Condition, ConditionKind, SensorSnapshot, Severity, Thresholds};
use crate::utils::{describe_age, millis_to_datetime};
use core::fmt;
use std::collections::BTreeMap;

/// A heartbeat older than this marks the pond offline.
pub const HEARTBEAT_STALE_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Ph,
    DissolvedOxygen,
    Turbidity,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Ph => "pH",
            Metric::DissolvedOxygen => "Dissolved oxygen",
            Metric::Turbidity => "Turbidity",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Ph => "",
            Metric::DissolvedOxygen => "mg/L",
            Metric::Turbidity => "NTU",
        }
    }

    fn of(kind: ConditionKind) -> Metric {
        match kind {
            ConditionKind::LowDissolvedOxygen => Metric::DissolvedOxygen,
            ConditionKind::HighTemperature | ConditionKind::LowTemperature => Metric::Temperature,
            ConditionKind::AbnormalPh => Metric::Ph,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingStatus {
    Normal,
    Warning,
    Critical,
    /// Missing, or a value no working probe reports.
    Unavailable,
}

impl From<Severity> for ReadingStatus {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Warning => ReadingStatus::Warning,
            Severity::Critical => ReadingStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorCard {
    pub metric: Metric,
    pub value: Option<f64>,
    pub status: ReadingStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceView {
    pub device_type: DeviceType,
    pub state: DeviceState,
    /// Known only for cached entries.
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PondView {
    pub id: PondId,
    pub name: String,
    pub online: bool,
    pub last_seen: Option<i64>,
    /// Rendered from the local cache because the backend was unreachable.
    pub stale: bool,
    pub sensors: Vec<SensorCard>,
    pub devices: Vec<DeviceView>,
    pub conditions: Vec<Condition>,
}

fn usable(value: Option<f64>, valid: impl Fn(f64) -> bool) -> Option<f64> {
    value.filter(|v| v.is_finite() && valid(*v))
}

/// One card per metric. Unusable readings are replaced by an in-range value
/// before evaluation so the remaining readings still get a status.
pub fn sensor_cards(record: Option<&SensorRecord>, thresholds: &Thresholds) -> (Vec<SensorCard>, Vec<Condition>) {
    let empty = SensorRecord::default();
    let record = record.unwrap_or(&empty);

    let temperature = usable(record.temperature, |t| t.abs() < thresholds::TEMP_SENTINEL);
    let ph = usable(record.ph, |p| (0.0..=14.0).contains(&p));
    let dox = usable(record.dissolved_oxygen, |d| (0.0..100.0).contains(&d));
    let turbidity = usable(record.turbidity, |t| t >= 0.0);

    let probe = SensorSnapshot {
        temperature: temperature.unwrap_or((thresholds.temp_min + thresholds.temp_max) / 2.0),
        ph: ph.unwrap_or((thresholds.ph_min + thresholds.ph_max) / 2.0),
        dissolved_oxygen: dox.unwrap_or(thresholds.do_min + 1.0),
        turbidity,
    };
    let conditions = thresholds::evaluate(&probe, thresholds);

    let status = |metric: Metric, value: Option<f64>| -> ReadingStatus {
        if value.is_none() {
            return ReadingStatus::Unavailable;
        }
        conditions
            .iter()
            .filter(|c| Metric::of(c.kind) == metric)
            .map(|c| ReadingStatus::from(c.severity))
            .next()
            .unwrap_or(ReadingStatus::Normal)
    };

    let cards = vec![
        SensorCard { metric: Metric::Temperature, value: temperature, status: status(Metric::Temperature, temperature) },
        SensorCard { metric: Metric::Ph, value: ph, status: status(Metric::Ph, ph) },
        SensorCard { metric: Metric::DissolvedOxygen, value: dox, status: status(Metric::DissolvedOxygen, dox) },
        SensorCard { metric: Metric::Turbidity, value: turbidity, status: status(Metric::Turbidity, turbidity) },
    ];

    // Conditions derived from placeholder readings are not real.
    let real = |kind: ConditionKind| match Metric::of(kind) {
        Metric::Temperature => temperature.is_some(),
        Metric::Ph => ph.is_some(),
        Metric::DissolvedOxygen => dox.is_some(),
        Metric::Turbidity => turbidity.is_some(),
    };
    let conditions = conditions.iter().filter(|c| real(c.kind)).cloned().collect();
    (cards, conditions)
}

pub fn device_views(devices: &BTreeMap<DeviceType, DeviceRecord>) -> Vec<DeviceView> {
    devices
        .iter()
        .map(|(device_type, record)| DeviceView {
            device_type: *device_type,
            state: DeviceState::from(record),
            updated_at: None,
        })
        .collect()
}

pub fn cached_device_views(devices: &BTreeMap<DeviceType, CachedDevice>) -> Vec<DeviceView> {
    devices
        .iter()
        .map(|(device_type, cached)| DeviceView {
            device_type: *device_type,
            state: cached.state,
            updated_at: Some(cached.updated_at),
        })
        .collect()
}

/// A fresh heartbeat decides; without one, fall back to `status/online`.
pub fn is_online(node: &PondNode, now_ms: i64) -> bool {
    match node.last_seen {
        Some(seen) => now_ms.saturating_sub(seen) <= HEARTBEAT_STALE_MS,
        None => node.status.as_ref().and_then(|s| s.online).unwrap_or(false),
    }
}

pub fn pond_view(id: &PondId, name: &str, node: &PondNode, thresholds: &Thresholds, now_ms: i64) -> PondView {
    let (sensors, conditions) = sensor_cards(node.sensors.as_ref(), thresholds);
    PondView {
        id: id.clone(),
        name: node.name.clone().unwrap_or_else(|| name.to_string()),
        online: is_online(node, now_ms),
        last_seen: node.last_seen,
        stale: false,
        sensors,
        devices: device_views(&node.devices()),
        conditions,
    }
}

/// What can be shown from the local cache alone.
pub fn cached_pond_view(id: &PondId, name: &str, devices: &BTreeMap<DeviceType, CachedDevice>) -> PondView {
    let (sensors, _) = sensor_cards(None, &Thresholds::default());
    PondView {
        id: id.clone(),
        name: name.to_string(),
        online: false,
        last_seen: None,
        stale: true,
        sensors,
        devices: cached_device_views(devices),
        conditions: Vec::new(),
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadingStatus::Normal => "ok",
            ReadingStatus::Warning => "WARNING",
            ReadingStatus::Critical => "CRITICAL",
            ReadingStatus::Unavailable => "n/a",
        })
    }
}

impl fmt::Display for PondView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = crate::utils::now_millis();
        let reach = if self.online { "online" } else { "offline" };
        write!(f, "{} ({}) - {}", self.name, self.id, reach)?;
        if let Some(seen) = self.last_seen {
            write!(f, ", last seen {}", describe_age(seen, now))?;
            if let Some(at) = millis_to_datetime(seen) {
                write!(f, " ({})", at.format("%Y-%m-%d %H:%M:%S UTC"))?;
            }
        }
        if self.stale {
            write!(f, " [cached]")?;
        }
        writeln!(f)?;

        for card in &self.sensors {
            match card.value {
                Some(v) => writeln!(f, "  {:<17} {:>7.2} {:<5} {}", card.metric.label(), v, card.metric.unit(), card.status)?,
                None => writeln!(f, "  {:<17} {:>7} {:<5} {}", card.metric.label(), "-", "", card.status)?,
            }
        }
        for device in &self.devices {
            let state = match device.state {
                DeviceState::ManualOff => "off",
                DeviceState::ManualOn => "on (manual)",
                DeviceState::AutoOn => "on (auto)",
            };
            write!(f, "  {:<17} {}", device.device_type.label(), state)?;
            if let Some(at) = device.updated_at {
                write!(f, ", as of {}", describe_age(at, now))?;
            }
            writeln!(f)?;
        }
        for c in &self.conditions {
            writeln!(f, "  ! {} [{}]", c.message, c.severity.as_str())?;
        }
        Ok(())
    }
}
