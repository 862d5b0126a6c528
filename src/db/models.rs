//! Diesel model structs for the account's ponds and settings.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::realtime::PondId;
use crate::schema;
use crate::services::auto_mode::AutomationSettings;
use crate::services::thresholds::Thresholds;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::ponds)]
pub struct Pond {
    pub id: i64,
    pub user_id: String,
    /// Key of the pond under `ponds/` in the realtime database.
    pub realtime_key: String,
    pub name: String,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pond {
    pub fn pond_id(&self) -> PondId {
        PondId(self.realtime_key.clone())
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::user_settings)]
#[diesel(primary_key(user_id))]
pub struct UserSettings {
    pub user_id: String,
    pub temp_min: f64,
    pub temp_max: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub do_min: f64,
    pub auto_mode_enabled: bool,
    pub alerts_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            ph_min: self.ph_min,
            ph_max: self.ph_max,
            do_min: self.do_min,
        }
    }

    pub fn automation(&self) -> AutomationSettings {
        AutomationSettings {
            auto_mode_enabled: self.auto_mode_enabled,
            alerts_enabled: self.alerts_enabled,
        }
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::user_settings)]
pub struct NewUserSettings {
    pub user_id: String,
    pub temp_min: f64,
    pub temp_max: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub do_min: f64,
    pub auto_mode_enabled: bool,
    pub alerts_enabled: bool,
}

impl NewUserSettings {
    pub fn defaults_for(user_id: &str) -> Self {
        let t = Thresholds::default();
        let a = AutomationSettings::default();
        NewUserSettings {
            user_id: user_id.to_string(),
            temp_min: t.temp_min,
            temp_max: t.temp_max,
            ph_min: t.ph_min,
            ph_max: t.ph_max,
            do_min: t.do_min,
            auto_mode_enabled: a.auto_mode_enabled,
            alerts_enabled: a.alerts_enabled,
        }
    }
}
