//! Port between the services and the realtime database.
//!
//! Services only see [`RealtimeStore`]; the HTTP implementation lives in
//! `crate::client`. Paths are built by [`paths`] and must match what the
//! dashboard and the pond controllers read and write.

use crate::models::realtime::{DeviceState, DeviceType, PondId};
use core::fmt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backend could not be reached at all (DNS, connect, timeout).
    Transport(String),
    Http { status: u16, message: String },
    /// A record was present but did not match the expected shape.
    Decode { path: String, field: String, message: String },
}

impl StoreError {
    /// True when the failure says nothing about the request itself, only that
    /// the backend is unreachable right now.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Http { status, .. } => *status >= 500,
            StoreError::Decode { .. } => false,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transport(s) => write!(f, "transport error: {}", s),
            StoreError::Http { status, message } => write!(f, "http {}: {}", status, message),
            StoreError::Decode { path, field, message } => {
                write!(f, "decode error at {} (field {}): {}", path, field, message)
            }
        }
    }
}

impl Error for StoreError {}

/// Minimal key/value surface of the realtime database.
///
/// Absent nodes read as `Value::Null`; writing `Value::Null` deletes.
pub trait RealtimeStore {
    fn get(&self, path: &str) -> Result<Value, StoreError>;

    /// Replace the node at `path`.
    fn set(&self, path: &str, value: &Value) -> Result<(), StoreError>;

    /// Merge the children of `fields` into the node at `path`.
    fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError>;

    /// Append under a generated child key and return that key.
    fn push(&self, path: &str, value: &Value) -> Result<String, StoreError>;
}

pub mod paths {
    use crate::models::realtime::{DeviceType, PondId};

    pub fn pond(pond: &PondId) -> String {
        format!("ponds/{}", pond)
    }

    pub fn sensors(pond: &PondId) -> String {
        format!("ponds/{}/sensors", pond)
    }

    pub fn devices(pond: &PondId) -> String {
        format!("ponds/{}/devices", pond)
    }

    pub fn device(pond: &PondId, device: DeviceType) -> String {
        format!("ponds/{}/devices/{}", pond, device)
    }

    pub fn device_ack(pond: &PondId, device: DeviceType) -> String {
        format!("ponds/{}/devices/{}/ack", pond, device)
    }

    pub fn alerts(pond: &PondId) -> String {
        format!("ponds/{}/alerts", pond)
    }

    pub fn config(pond: &PondId) -> String {
        format!("ponds/{}/config", pond)
    }

    pub fn last_seen(pond: &PondId) -> String {
        format!("ponds/{}/lastSeen", pond)
    }
}

/// Decode a node, keeping the offending field path in the error.
pub fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<Option<T>, StoreError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_path_to_error::deserialize(value)
        .map(Some)
        .map_err(|e| StoreError::Decode {
            path: path.to_string(),
            field: e.path().to_string(),
            message: e.inner().to_string(),
        })
}

pub fn read<T: DeserializeOwned, S: RealtimeStore + ?Sized>(store: &S, path: &str) -> Result<Option<T>, StoreError> {
    let value = store.get(path)?;
    decode(path, value)
}

/// The one write path for device state, shared by manual toggles, auto mode
/// and queue replay. `state` and `mode` are written in a single update.
pub fn write_device<S: RealtimeStore + ?Sized>(
    store: &S,
    pond: &PondId,
    device: DeviceType,
    state: DeviceState,
) -> Result<(), StoreError> {
    store.update(
        &paths::device(pond, device),
        &json!({ "state": state.state_value(), "mode": state.mode() }),
    )
}

#[cfg(test)]
pub mod memory {
    //! In-memory [`RealtimeStore`] with failure injection.

    use super::{RealtimeStore, StoreError};
    use serde_json::{Map, Value};
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    pub struct MemoryStore {
        root: RefCell<Value>,
        offline: Cell<bool>,
        failing: RefCell<Vec<(String, StoreError)>>,
        writes: RefCell<Vec<(String, Value)>>,
        next_id: Cell<u64>,
    }

    fn segments(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|s| !s.is_empty())
    }

    fn node_mut<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
        let mut node = root;
        for seg in segments(path) {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .expect("node was just made an object")
                .entry(seg.to_string())
                .or_insert(Value::Null);
        }
        node
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a node without recording it as a write.
        pub fn with(self, path: &str, value: Value) -> Self {
            *node_mut(&mut self.root.borrow_mut(), path) = value;
            self
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.set(offline);
        }

        /// Make every write at or below `prefix` fail with `error`.
        pub fn fail_writes_under(&self, prefix: &str, error: StoreError) {
            self.failing.borrow_mut().push((prefix.to_string(), error));
        }

        pub fn heal(&self) {
            self.failing.borrow_mut().clear();
        }

        pub fn writes(&self) -> Vec<(String, Value)> {
            self.writes.borrow().clone()
        }

        pub fn clear_writes(&self) {
            self.writes.borrow_mut().clear();
        }

        pub fn value_at(&self, path: &str) -> Value {
            let root = self.root.borrow();
            let mut node = &*root;
            for seg in segments(path) {
                match node.get(seg) {
                    Some(next) => node = next,
                    None => return Value::Null,
                }
            }
            node.clone()
        }

        fn check_reachable(&self) -> Result<(), StoreError> {
            if self.offline.get() {
                return Err(StoreError::Transport("connection refused".to_string()));
            }
            Ok(())
        }

        fn check_write(&self, path: &str) -> Result<(), StoreError> {
            self.check_reachable()?;
            let failing = self.failing.borrow();
            match failing.iter().find(|(prefix, _)| path.starts_with(prefix.as_str())) {
                Some((_, err)) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    impl RealtimeStore for MemoryStore {
        fn get(&self, path: &str) -> Result<Value, StoreError> {
            self.check_reachable()?;
            Ok(self.value_at(path))
        }

        fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
            self.check_write(path)?;
            *node_mut(&mut self.root.borrow_mut(), path) = value.clone();
            self.writes.borrow_mut().push((path.to_string(), value.clone()));
            Ok(())
        }

        fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError> {
            self.check_write(path)?;
            {
                let mut root = self.root.borrow_mut();
                let node = node_mut(&mut root, path);
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                if let (Some(target), Some(src)) = (node.as_object_mut(), fields.as_object()) {
                    for (k, v) in src {
                        if v.is_null() {
                            target.remove(k);
                        } else {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            self.writes.borrow_mut().push((path.to_string(), fields.clone()));
            Ok(())
        }

        fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
            self.check_write(path)?;
            let n = self.next_id.get() + 1;
            self.next_id.set(n);
            let key = format!("-m{:06}", n);
            let full = format!("{}/{}", path, key);
            *node_mut(&mut self.root.borrow_mut(), &full) = value.clone();
            self.writes.borrow_mut().push((full, value.clone()));
            Ok(key)
        }
    }
}
