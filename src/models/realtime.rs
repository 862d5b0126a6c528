//! Records stored in the realtime database under `ponds/{pondId}`.
//!
//! Scope: types only. Paths live in `crate::store::paths`, reads and writes in
//! `crate::store`.
//!
//! Notes
//! - Wire field names are preserved exactly (`dissolvedOxygen`, `lastSeen`, ...).
//! - Timestamps are milliseconds since the Unix epoch, as written by the
//!   dashboard and the pond controllers.
//! - Device records are `{state: 0|1, mode: "manual"|"auto"}`; in memory they are
//!   folded into [`DeviceState`] so invalid combinations cannot be expressed.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// =====================
// Identifiers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PondId(pub String);

impl fmt::Display for PondId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Pump,
    Aerator,
    Light,
    Camera,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [DeviceType::Pump, DeviceType::Aerator, DeviceType::Light, DeviceType::Camera];

    /// Path segment under `ponds/{pondId}/devices`.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Pump => "pump",
            DeviceType::Aerator => "aerator",
            DeviceType::Light => "light",
            DeviceType::Camera => "camera",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceType::Pump => "Water pump",
            DeviceType::Aerator => "Aerator",
            DeviceType::Light => "Light",
            DeviceType::Camera => "Camera",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown device type: {}", s))
    }
}

/// One device of one pond. Serialized as `"{pondId}/{deviceType}"`, the id
/// used by queued actions and the device cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey {
    pub pond_id: PondId,
    pub device_type: DeviceType,
}

impl DeviceKey {
    pub fn new(pond_id: PondId, device_type: DeviceType) -> Self {
        DeviceKey { pond_id, device_type }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pond_id, self.device_type)
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (pond, device) = value
            .rsplit_once('/')
            .ok_or_else(|| format!("device id must be <pond>/<device>: {}", value))?;
        if pond.is_empty() {
            return Err(format!("device id has an empty pond id: {}", value));
        }
        Ok(DeviceKey {
            pond_id: PondId(pond.to_string()),
            device_type: device.parse()?,
        })
    }
}

impl From<DeviceKey> for String {
    fn from(value: DeviceKey) -> Self {
        value.to_string()
    }
}

// =====================
// Devices
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Manual,
    Auto,
}

/// Raw `ponds/{pondId}/devices/{type}` node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub state: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeviceMode>,
    /// Last acknowledgement echo written by the pond controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
}

/// Effective device state.
///
/// A record that is off is always `ManualOff`, whatever its mode says; a
/// record that is on without a mode is `ManualOn`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    ManualOff,
    ManualOn,
    AutoOn,
}

impl DeviceState {
    pub fn manual(on: bool) -> Self {
        if on { DeviceState::ManualOn } else { DeviceState::ManualOff }
    }

    pub fn is_on(self) -> bool {
        !matches!(self, DeviceState::ManualOff)
    }

    pub fn state_value(self) -> u8 {
        u8::from(self.is_on())
    }

    pub fn mode(self) -> DeviceMode {
        match self {
            DeviceState::AutoOn => DeviceMode::Auto,
            DeviceState::ManualOff | DeviceState::ManualOn => DeviceMode::Manual,
        }
    }
}

impl From<&DeviceRecord> for DeviceState {
    fn from(record: &DeviceRecord) -> Self {
        match (record.state, record.mode) {
            (0, _) => DeviceState::ManualOff,
            (_, Some(DeviceMode::Auto)) => DeviceState::AutoOn,
            (_, _) => DeviceState::ManualOn,
        }
    }
}

// =====================
// Sensors
// =====================

/// Raw `ponds/{pondId}/sensors` node as pushed by the pond controller.
/// Missing readings stay `None`; validity is judged by the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
    #[serde(default)]
    pub dissolved_oxygen: Option<f64>,
    #[serde(default)]
    pub turbidity: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

// =====================
// Alerts, heartbeat, whole pond node
// =====================

/// `ponds/{pondId}/alerts/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PondStatusRecord {
    #[serde(default)]
    pub online: Option<bool>,
}

/// Subset of `ponds/{pondId}` read for status rendering. Schedules, alerts and
/// the config mirror are ignored here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PondNode {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sensors: Option<SensorRecord>,
    /// Keyed by device type; unknown types are kept raw and skipped by
    /// [`PondNode::devices`].
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRecord>,
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub status: Option<PondStatusRecord>,
}

impl PondNode {
    pub fn devices(&self) -> BTreeMap<DeviceType, DeviceRecord> {
        self.devices
            .iter()
            .filter_map(|(k, v)| k.parse::<DeviceType>().ok().map(|t| (t, v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_state_folds_record_combinations() {
        let rec = |state, mode| DeviceRecord { state, mode, ack: None };
        assert_eq!(DeviceState::from(&rec(0, None)), DeviceState::ManualOff);
        assert_eq!(DeviceState::from(&rec(0, Some(DeviceMode::Auto))), DeviceState::ManualOff);
        assert_eq!(DeviceState::from(&rec(1, None)), DeviceState::ManualOn);
        assert_eq!(DeviceState::from(&rec(1, Some(DeviceMode::Manual))), DeviceState::ManualOn);
        assert_eq!(DeviceState::from(&rec(1, Some(DeviceMode::Auto))), DeviceState::AutoOn);
    }

    #[test]
    fn device_key_string_form() {
        let key: DeviceKey = "pond-a/aerator".to_string().try_into().expect("valid key");
        assert_eq!(key, DeviceKey::new(PondId("pond-a".into()), DeviceType::Aerator));
        assert_eq!(String::from(key), "pond-a/aerator");

        assert!(DeviceKey::try_from("aerator".to_string()).is_err());
        assert!(DeviceKey::try_from("/aerator".to_string()).is_err());
        assert!(DeviceKey::try_from("pond-a/heater".to_string()).is_err());
    }

    #[test]
    fn parses_pond_fixture() {
        let json = std::fs::read_to_string("tests/data/pond-node.json").expect("fixture present");
        let node: PondNode = serde_json::from_str(&json).expect("parse pond node");

        let sensors = node.sensors.as_ref().expect("fixture has sensors");
        assert_eq!(sensors.dissolved_oxygen, Some(3.4));
        assert_eq!(sensors.turbidity, None);
        assert_eq!(node.last_seen, Some(1_760_870_400_000));

        let devices = node.devices();
        assert_eq!(devices.len(), 3, "unknown device types are skipped");
        assert_eq!(DeviceState::from(&devices[&DeviceType::Aerator]), DeviceState::AutoOn);
        assert_eq!(DeviceState::from(&devices[&DeviceType::Pump]), DeviceState::ManualOff);
    }
}
