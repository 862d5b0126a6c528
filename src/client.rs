//! Blocking HTTP client for the realtime database REST surface.
//!
//! - Blocking client using `ureq` (no async), one agent per process.
//! - Every node is addressed as `{base}/{path}.json`; `null` means absent.
//! - PUT replaces, PATCH merges children, POST appends and answers with the
//!   generated key as `{"name": "-N..."}`.
//!
//! Authentication
//! - The database secret or ID token is passed as the `auth` query parameter.
//!   An empty token sends unauthenticated requests (open database rules).

use crate::store::{RealtimeStore, StoreError};
use serde_json::Value;
use std::time::Duration;

pub struct RealtimeClient {
    agent: ureq::Agent,
    base_url: String,
    auth: Option<String>,
}

impl RealtimeClient {
    pub fn new(base_url: &str, auth: Option<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        RealtimeClient {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: auth.filter(|a| !a.trim().is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, path)
        }
    }

    fn authed<B>(&self, req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let req = req.header("Accept", "application/json");
        match &self.auth {
            Some(token) => req.query("auth", token),
            None => req,
        }
    }

    fn finish(path: &str, resp: Result<http::Response<ureq::Body>, ureq::Error>) -> Result<Value, StoreError> {
        let mut resp = resp.map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        // `print=silent` answers 204 with no body.
        if status == http::StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(Value::Null);
        }

        let de = &mut serde_json::Deserializer::from_str(&body);
        serde_path_to_error::deserialize(de).map_err(|e| StoreError::Decode {
            path: path.to_string(),
            field: e.path().to_string(),
            message: e.inner().to_string(),
        })
    }
}

/// The REST surface reports failures as `{"error": "..."}`.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                String::from("<no body>")
            } else {
                body.to_string()
            }
        })
}

impl RealtimeStore for RealtimeClient {
    fn get(&self, path: &str) -> Result<Value, StoreError> {
        let req = self.authed(self.agent.get(self.url(path)));
        Self::finish(path, req.call())
    }

    fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let req = self.authed(self.agent.put(self.url(path))).query("print", "silent");
        Self::finish(path, req.send_json(value)).map(|_| ())
    }

    fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError> {
        let req = self.authed(self.agent.patch(self.url(path))).query("print", "silent");
        Self::finish(path, req.send_json(fields)).map(|_| ())
    }

    fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let req = self.authed(self.agent.post(self.url(path)));
        let created = Self::finish(path, req.send_json(value))?;
        created
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode {
                path: path.to_string(),
                field: "name".to_string(),
                message: "push response carries no generated key".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_node_urls() {
        let client = RealtimeClient::new("https://ponds.example.org/", None, Duration::from_secs(1));
        assert_eq!(client.url("ponds/a/sensors"), "https://ponds.example.org/ponds/a/sensors.json");
        assert_eq!(client.url("/ponds/a/"), "https://ponds.example.org/ponds/a.json");
        assert_eq!(client.url(""), "https://ponds.example.org/.json");
    }

    #[test]
    fn blank_auth_is_dropped() {
        let client = RealtimeClient::new("https://x", Some("  ".into()), Duration::from_secs(1));
        assert!(client.auth.is_none());
    }

    #[test]
    fn extracts_rest_error_messages() {
        assert_eq!(error_message(r#"{"error":"Permission denied"}"#), "Permission denied");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
        assert_eq!(error_message(""), "<no body>");
    }
}
