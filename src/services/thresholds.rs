//! Threshold evaluation of a pond's sensor snapshot.
//!
//! `evaluate` is pure: it turns one snapshot plus the account's bounds into
//! the set of active conditions. Conditions are never stored; they are
//! recomputed for every snapshot.

use crate::models::realtime::{DeviceType, SensorRecord};
use serde::{Deserialize, Serialize};

/// A reading this far past its bound is critical rather than a warning.
pub const DO_CRITICAL_MARGIN: f64 = 1.0;
pub const TEMP_CRITICAL_MARGIN: f64 = 3.0;
pub const PH_CRITICAL_MARGIN: f64 = 0.5;

/// Probes report ±100 (or beyond) when disconnected.
pub const TEMP_SENTINEL: f64 = 100.0;

/// Per-account bounds. Field names are also the layout of the
/// `ponds/{pondId}/config` mirror.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub temp_min: f64,
    pub temp_max: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub do_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            temp_min: 25.0,
            temp_max: 32.0,
            ph_min: 6.5,
            ph_max: 8.5,
            do_min: 4.0,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        let all = [self.temp_min, self.temp_max, self.ph_min, self.ph_max, self.do_min];
        if all.iter().any(|v| !v.is_finite()) {
            return Err("thresholds must be finite numbers".to_string());
        }
        if self.temp_min >= self.temp_max {
            return Err(format!(
                "temp_min ({}) must be below temp_max ({})",
                self.temp_min, self.temp_max
            ));
        }
        if self.ph_min >= self.ph_max {
            return Err(format!("ph_min ({}) must be below ph_max ({})", self.ph_min, self.ph_max));
        }
        if !(0.0..=14.0).contains(&self.ph_min) || !(0.0..=14.0).contains(&self.ph_max) {
            return Err("pH bounds must lie within 0..=14".to_string());
        }
        if self.do_min < 0.0 {
            return Err(format!("do_min ({}) must not be negative", self.do_min));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub ph: f64,
    pub dissolved_oxygen: f64,
    pub turbidity: Option<f64>,
}

impl SensorSnapshot {
    /// `None` when one of the required readings is missing from the record.
    pub fn from_record(record: &SensorRecord) -> Option<Self> {
        Some(SensorSnapshot {
            temperature: record.temperature?,
            ph: record.ph?,
            dissolved_oxygen: record.dissolved_oxygen?,
            turbidity: record.turbidity,
        })
    }

    pub fn is_valid(&self) -> bool {
        let temperature_ok = self.temperature.is_finite() && self.temperature.abs() < TEMP_SENTINEL;
        let ph_ok = self.ph.is_finite() && (0.0..=14.0).contains(&self.ph);
        let do_ok = self.dissolved_oxygen.is_finite() && (0.0..100.0).contains(&self.dissolved_oxygen);
        let turbidity_ok = self.turbidity.is_none_or(|t| t.is_finite() && t >= 0.0);
        temperature_ok && ph_ok && do_ok && turbidity_ok
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    #[serde(rename = "low_do")]
    LowDissolvedOxygen,
    #[serde(rename = "high_temp")]
    HighTemperature,
    #[serde(rename = "low_temp")]
    LowTemperature,
    #[serde(rename = "abnormal_ph")]
    AbnormalPh,
}

impl ConditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionKind::LowDissolvedOxygen => "low_do",
            ConditionKind::HighTemperature => "high_temp",
            ConditionKind::LowTemperature => "low_temp",
            ConditionKind::AbnormalPh => "abnormal_ph",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Auto mode answers it by switching `device` on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceAction {
    pub device: DeviceType,
}

impl DeviceAction {
    fn start(device: DeviceType) -> Option<Self> {
        Some(DeviceAction { device })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub severity: Severity,
    pub message: String,
    pub action: Option<DeviceAction>,
}

fn below(value: f64, bound: f64, margin: f64) -> Severity {
    if value < bound - margin { Severity::Critical } else { Severity::Warning }
}

fn above(value: f64, bound: f64, margin: f64) -> Severity {
    if value > bound + margin { Severity::Critical } else { Severity::Warning }
}

/// Conditions breached by `snapshot`, in no particular order. An invalid
/// snapshot (disconnected probe, out-of-range reading) yields nothing.
pub fn evaluate(snapshot: &SensorSnapshot, thresholds: &Thresholds) -> Vec<Condition> {
    let mut out = Vec::new();
    if !snapshot.is_valid() {
        return out;
    }

    let dox = snapshot.dissolved_oxygen;
    if dox < thresholds.do_min {
        out.push(Condition {
            kind: ConditionKind::LowDissolvedOxygen,
            severity: below(dox, thresholds.do_min, DO_CRITICAL_MARGIN),
            message: format!("Dissolved oxygen low: {:.2} mg/L (min {:.2})", dox, thresholds.do_min),
            action: DeviceAction::start(DeviceType::Aerator),
        });
    }

    let temp = snapshot.temperature;
    if temp > thresholds.temp_max {
        out.push(Condition {
            kind: ConditionKind::HighTemperature,
            severity: above(temp, thresholds.temp_max, TEMP_CRITICAL_MARGIN),
            message: format!("Water temperature high: {:.1} °C (max {:.1})", temp, thresholds.temp_max),
            action: DeviceAction::start(DeviceType::Pump),
        });
    } else if temp < thresholds.temp_min {
        out.push(Condition {
            kind: ConditionKind::LowTemperature,
            severity: below(temp, thresholds.temp_min, TEMP_CRITICAL_MARGIN),
            message: format!("Water temperature low: {:.1} °C (min {:.1})", temp, thresholds.temp_min),
            action: None,
        });
    }

    let ph = snapshot.ph;
    let ph_severity = if ph > thresholds.ph_max {
        Some(above(ph, thresholds.ph_max, PH_CRITICAL_MARGIN))
    } else if ph < thresholds.ph_min {
        Some(below(ph, thresholds.ph_min, PH_CRITICAL_MARGIN))
    } else {
        None
    };
    if let Some(severity) = ph_severity {
        out.push(Condition {
            kind: ConditionKind::AbnormalPh,
            severity,
            message: format!(
                "pH out of range: {:.2} (expected {:.1}-{:.1})",
                ph, thresholds.ph_min, thresholds.ph_max
            ),
            action: DeviceAction::start(DeviceType::Pump),
        });
    }

    out
}
