//! Handwritten Diesel schema declarations for the tables this service reads.
//!
//! The dashboard owns many more tables (alerts, profiles, readings, ...); only
//! the account's ponds and its settings row are declared here. Migrations in
//! `migrations/` create them when absent.

diesel::table! {
    ponds (id) {
        id -> BigInt,
        user_id -> Text,
        realtime_key -> Text,
        name -> Text,
        location -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    user_settings (user_id) {
        user_id -> Text,
        temp_min -> Double,
        temp_max -> Double,
        ph_min -> Double,
        ph_max -> Double,
        do_min -> Double,
        auto_mode_enabled -> Bool,
        alerts_enabled -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
