use crate::db::models as dbm;
use crate::local::{self, CachedPond, LocalStorage};
use crate::models::realtime::PondId;
use crate::schema;
use crate::services::auto_mode::AutomationSettings;
use crate::services::thresholds::Thresholds;
use crate::store::{RealtimeStore, paths};
use diesel::PgConnection;
use diesel::prelude::*;
use log::{info, warn};

/// What the realtime loop needs from the relational store.
#[derive(Debug, Clone)]
pub struct AccountSettings {
    pub ponds: Vec<CachedPond>,
    pub thresholds: Thresholds,
    pub automation: AutomationSettings,
}

/// Where the running service re-reads thresholds and automation toggles.
pub trait SettingsSource {
    fn load(&mut self) -> Result<(Thresholds, AutomationSettings), String>;
}

/// The account's `user_settings` row, re-read on every call.
pub struct DbSettings<'a> {
    conn: &'a mut PgConnection,
    account_id: String,
}

impl<'a> DbSettings<'a> {
    pub fn new(conn: &'a mut PgConnection, account_id: &str) -> Self {
        DbSettings {
            conn,
            account_id: account_id.to_string(),
        }
    }
}

impl SettingsSource for DbSettings<'_> {
    fn load(&mut self) -> Result<(Thresholds, AutomationSettings), String> {
        let settings = load_user_settings(self.conn, &self.account_id)?;
        let thresholds = settings.thresholds();
        thresholds
            .validate()
            .map_err(|e| format!("stored thresholds for {} are invalid: {}", self.account_id, e))?;
        Ok((thresholds, settings.automation()))
    }
}

/// Load the account's ponds and settings, mirror the thresholds into every
/// pond's `config` node, and refresh the ponds cache.
pub fn sync_all<S, L>(conn: &mut PgConnection, store: &S, storage: &L, account_id: &str) -> Result<AccountSettings, String>
where
    S: RealtimeStore + ?Sized,
    L: LocalStorage + ?Sized,
{
    let (thresholds, automation) = DbSettings::new(conn, account_id).load()?;

    let ponds: Vec<CachedPond> = load_ponds(conn, account_id)?
        .iter()
        .map(|p| CachedPond {
            id: p.pond_id(),
            name: p.name.clone(),
        })
        .collect();
    local::remember_ponds(storage, &ponds);

    let ids: Vec<PondId> = ponds.iter().map(|p| p.id.clone()).collect();
    mirror_thresholds(store, &ids, &thresholds);

    info!(
        "Settings: {} pond(s), auto_mode={}, alerts={}",
        ponds.len(),
        automation.auto_mode_enabled,
        automation.alerts_enabled
    );
    Ok(AccountSettings {
        ponds,
        thresholds,
        automation,
    })
}

pub fn load_ponds(conn: &mut PgConnection, account_id: &str) -> Result<Vec<dbm::Pond>, String> {
    use schema::ponds::dsl as P;

    P::ponds
        .filter(P::user_id.eq(account_id))
        .order(P::id.asc())
        .select(dbm::Pond::as_select())
        .load(conn)
        .map_err(|e| format!("fetch ponds failed: {}", e))
}

/// The account's settings row; a first run inserts the defaults.
pub fn load_user_settings(conn: &mut PgConnection, account_id: &str) -> Result<dbm::UserSettings, String> {
    use schema::user_settings::dsl as U;

    let existing = U::user_settings
        .filter(U::user_id.eq(account_id))
        .select(dbm::UserSettings::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch user settings failed: {}", e))?;
    if let Some(settings) = existing {
        return Ok(settings);
    }

    info!("Settings: no row for {}, storing defaults", account_id);
    diesel::insert_into(U::user_settings)
        .values(&dbm::NewUserSettings::defaults_for(account_id))
        .on_conflict(U::user_id)
        .do_nothing()
        .execute(conn)
        .map_err(|e| format!("insert default user settings failed: {}", e))?;

    U::user_settings
        .filter(U::user_id.eq(account_id))
        .select(dbm::UserSettings::as_select())
        .first(conn)
        .map_err(|e| format!("fetch user settings failed: {}", e))
}

/// Best-effort: a pond whose mirror cannot be written keeps its old config.
pub fn mirror_thresholds<S: RealtimeStore + ?Sized>(store: &S, ponds: &[PondId], thresholds: &Thresholds) -> usize {
    let value = match serde_json::to_value(thresholds) {
        Ok(v) => v,
        Err(e) => {
            warn!("Settings: cannot encode thresholds: {}", e);
            return 0;
        }
    };
    let mut written = 0;
    for pond in ponds {
        match store.set(&paths::config(pond), &value) {
            Ok(()) => written += 1,
            Err(e) => warn!("Settings: mirroring thresholds to pond {} failed: {}", pond, e),
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn mirrors_thresholds_into_each_pond() {
        let store = MemoryStore::new();
        store.fail_writes_under("ponds/b/", StoreError::Transport("refused".into()));
        let ponds = [PondId("a".into()), PondId("b".into())];

        let written = mirror_thresholds(&store, &ponds, &Thresholds::default());

        assert_eq!(written, 1);
        assert_eq!(
            store.value_at("ponds/a/config"),
            json!({ "temp_min": 25.0, "temp_max": 32.0, "ph_min": 6.5, "ph_max": 8.5, "do_min": 4.0 })
        );
        assert!(store.value_at("ponds/b/config").is_null());
    }
}
