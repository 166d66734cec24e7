// src/core/haproxy/dataplane.rs

//! REST client for the HAProxy Dataplane API.
//!
//! Supports both API v2 (flat server endpoints addressed with a `backend`
//! query parameter) and v3 (server endpoints nested under the backend
//! resource).

use crate::config::{ApiVersion, BackendMode, HaproxyConfig};
use crate::core::errors::DiscoveryError;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// On/off switch values used throughout the Dataplane configuration schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Enabled,
    Disabled,
}

/// One server entry as written to the Dataplane API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerPayload {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<Flag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub algorithm: String,
}

/// Backend creation payload; `extra` carries per-service fields merged from
/// `haproxy.backend_options`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPayload {
    pub name: String,
    pub mode: BackendMode,
    pub balance: Balance,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Thin wrapper around the HAProxy Dataplane API.
pub struct DataplaneClient {
    http: reqwest::Client,
    base: String,
    api_version: ApiVersion,
    username: String,
    password: String,
}

impl DataplaneClient {
    pub fn new(config: &HaproxyConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            http,
            base: format!(
                "{}/{}",
                config.base_url.trim_end_matches('/'),
                config.api_version
            ),
            api_version: config.api_version,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    // ── Configuration version ───────────────────────────────────────

    /// Return the current HAProxy configuration version.
    pub async fn configuration_version(&self) -> Result<i64, DiscoveryError> {
        let resp = self
            .send(self.request(Method::GET, "/services/haproxy/configuration/version"))
            .await?;
        let body = resp.text().await?;
        body.trim().parse().map_err(|_| DiscoveryError::Dataplane {
            status: 200,
            body: format!("unexpected configuration version body: {body}"),
        })
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Start a new transaction rooted at the given version; returns its id.
    pub async fn create_transaction(&self, version: i64) -> Result<String, DiscoveryError> {
        let resp = self
            .send(
                self.request(Method::POST, "/services/haproxy/transactions")
                    .query(&[("version", version.to_string())]),
            )
            .await?;
        let value: Value = resp.json().await?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::Dataplane {
                status: 200,
                body: "transaction response missing id".to_string(),
            })
    }

    /// Commit a transaction. A 409 surfaces as
    /// [`DiscoveryError::VersionConflict`].
    pub async fn commit_transaction(&self, id: &str) -> Result<(), DiscoveryError> {
        self.send(self.request(Method::PUT, &format!("/services/haproxy/transactions/{id}")))
            .await?;
        Ok(())
    }

    /// Delete (abort) a transaction.
    pub async fn delete_transaction(&self, id: &str) -> Result<(), DiscoveryError> {
        self.send(self.request(
            Method::DELETE,
            &format!("/services/haproxy/transactions/{id}"),
        ))
        .await?;
        Ok(())
    }

    // ── Backends ────────────────────────────────────────────────────

    /// Fetch a backend by name; `None` when it does not exist.
    pub async fn get_backend(
        &self,
        name: &str,
        transaction_id: Option<&str>,
    ) -> Result<Option<Value>, DiscoveryError> {
        let req = self
            .request(
                Method::GET,
                &format!("/services/haproxy/configuration/backends/{name}"),
            )
            .query(&txn_params(transaction_id));
        match self.send(req).await {
            Ok(resp) => {
                let value: Value = resp.json().await?;
                Ok(Some(value.get("data").cloned().unwrap_or(value)))
            }
            Err(DiscoveryError::Dataplane { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_backend(
        &self,
        payload: &BackendPayload,
        transaction_id: &str,
    ) -> Result<(), DiscoveryError> {
        self.send(
            self.request(Method::POST, "/services/haproxy/configuration/backends")
                .query(&[("transaction_id", transaction_id)])
                .json(payload),
        )
        .await?;
        Ok(())
    }

    // ── Servers ─────────────────────────────────────────────────────

    pub async fn list_servers(
        &self,
        backend: &str,
        transaction_id: Option<&str>,
    ) -> Result<Vec<Value>, DiscoveryError> {
        let req = match self.api_version {
            ApiVersion::V2 => self
                .request(Method::GET, "/services/haproxy/configuration/servers")
                .query(&[("backend", backend)]),
            ApiVersion::V3 => self.request(
                Method::GET,
                &format!("/services/haproxy/configuration/backends/{backend}/servers"),
            ),
        };
        let resp = self.send(req.query(&txn_params(transaction_id))).await?;
        let value: Value = resp.json().await?;
        let servers = match value {
            Value::Array(items) => items,
            Value::Object(ref map) => map
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(servers)
    }

    pub async fn create_server(
        &self,
        backend: &str,
        payload: &ServerPayload,
        transaction_id: &str,
    ) -> Result<(), DiscoveryError> {
        let req = match self.api_version {
            ApiVersion::V2 => self
                .request(Method::POST, "/services/haproxy/configuration/servers")
                .query(&[("backend", backend)]),
            ApiVersion::V3 => self.request(
                Method::POST,
                &format!("/services/haproxy/configuration/backends/{backend}/servers"),
            ),
        };
        self.send(
            req.query(&[("transaction_id", transaction_id)])
                .json(payload),
        )
        .await?;
        Ok(())
    }

    pub async fn replace_server(
        &self,
        name: &str,
        backend: &str,
        payload: &ServerPayload,
        transaction_id: &str,
    ) -> Result<(), DiscoveryError> {
        let req = match self.api_version {
            ApiVersion::V2 => self
                .request(
                    Method::PUT,
                    &format!("/services/haproxy/configuration/servers/{name}"),
                )
                .query(&[("backend", backend)]),
            ApiVersion::V3 => self.request(
                Method::PUT,
                &format!("/services/haproxy/configuration/backends/{backend}/servers/{name}"),
            ),
        };
        self.send(
            req.query(&[("transaction_id", transaction_id)])
                .json(payload),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_server(
        &self,
        name: &str,
        backend: &str,
        transaction_id: &str,
    ) -> Result<(), DiscoveryError> {
        let req = match self.api_version {
            ApiVersion::V2 => self
                .request(
                    Method::DELETE,
                    &format!("/services/haproxy/configuration/servers/{name}"),
                )
                .query(&[("backend", backend)]),
            ApiVersion::V3 => self.request(
                Method::DELETE,
                &format!("/services/haproxy/configuration/backends/{backend}/servers/{name}"),
            ),
        };
        self.send(req.query(&[("transaction_id", transaction_id)]))
            .await?;
        Ok(())
    }

    // ── Internal HTTP helpers ───────────────────────────────────────

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!(%method, path, "Dataplane request");
        self.http
            .request(method, format!("{}{}", self.base, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, DiscoveryError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(DiscoveryError::VersionConflict);
        }
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::Dataplane {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

fn txn_params(transaction_id: Option<&str>) -> Vec<(&'static str, String)> {
    match transaction_id {
        Some(id) => vec![("transaction_id", id.to_string())],
        None => Vec::new(),
    }
}
