//! Consul HTTP Client
//!
//! Thin adapter over the Consul agent's HTTP API: KV reads/writes plus the
//! agent endpoints for service registration and health-check updates. All
//! responses other than the documented 404 cases must be 2xx; anything else
//! is surfaced as an error with status and body.

use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One pair from Consul's KV read API.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Response shape of `/v1/agent/self`, reduced to what we consume.
#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Member")]
    member: AgentMember,
}

#[derive(Debug, Deserialize)]
struct AgentMember {
    #[serde(rename = "Addr")]
    addr: String,
}

/// Body for `/v1/agent/service/register`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Address", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "Port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(rename = "Check")]
    pub check: ServiceCheck,
}

/// TTL health check attached to the registration.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCheck {
    #[serde(rename = "TTL")]
    pub ttl: String,
}

/// Health status published through the TTL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Node is unsealed and serving.
    Passing,
    /// Node is sealed: registered but degraded.
    Warning,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckUpdate {
    #[serde(rename = "Status")]
    status: &'static str,
}

/// Render a duration the way Consul expects TTLs ("5s", "1500ms").
pub fn ttl_string(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Cloneable Consul API client. Cloning shares the underlying
/// connection pool.
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}://{}", config.scheme, config.address),
            token: config.token.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if !self.token.is_empty() {
            req = req.header("X-Consul-Token", &self.token);
        }
        req
    }

    /// Read a single key. Missing keys are `Ok(None)`.
    pub async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", key))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("get {}: {}", key, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, |m| Error::Storage(format!("get {}: {}", key, m)))
            .await?;

        let pairs: Vec<KvPair> = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("get {}: invalid response: {}", key, e)))?;

        match pairs.into_iter().next() {
            Some(pair) => {
                let value = match pair.value {
                    Some(encoded) => BASE64.decode(encoded).map_err(|e| {
                        Error::Storage(format!("get {}: invalid value encoding: {}", key, e))
                    })?,
                    None => Vec::new(),
                };
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write a single key.
    pub async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v1/kv/{}", key))
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| Error::Storage(format!("put {}: {}", key, e)))?;

        check_status(response, |m| Error::Storage(format!("put {}: {}", key, m))).await?;
        Ok(())
    }

    /// Delete a single key. Deleting a missing key succeeds.
    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/kv/{}", key))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("delete {}: {}", key, e)))?;

        check_status(response, |m| Error::Storage(format!("delete {}: {}", key, m))).await?;
        Ok(())
    }

    /// List keys under a prefix, folded at `separator`. A missing prefix
    /// is an empty list.
    pub async fn kv_keys(&self, prefix: &str, separator: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", prefix))
            .query(&[("keys", ""), ("separator", separator)])
            .send()
            .await
            .map_err(|e| Error::Storage(format!("list {}: {}", prefix, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response =
            check_status(response, |m| Error::Storage(format!("list {}: {}", prefix, m))).await?;

        response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("list {}: invalid response: {}", prefix, e)))
    }

    /// Register (or idempotently re-register) a service with the agent.
    pub async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(registration)
            .send()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;

        check_status(response, Error::Registration).await?;
        Ok(())
    }

    /// Remove a service registration.
    pub async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{}", service_id),
            )
            .send()
            .await
            .map_err(|e| Error::Deregistration(e.to_string()))?;

        check_status(response, Error::Deregistration).await?;
        Ok(())
    }

    /// Refresh a TTL check with the given status.
    pub async fn update_check(&self, check_id: &str, status: CheckStatus) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/check/update/{}", check_id),
            )
            .json(&CheckUpdate {
                status: status.as_str(),
            })
            .send()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;

        check_status(response, Error::Registration).await?;
        Ok(())
    }

    /// The agent's own advertise address, usable as this node's host.
    pub async fn agent_self_addr(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, "/v1/agent/self")
            .send()
            .await
            .map_err(|e| Error::Storage(format!("agent self: {}", e)))?;

        let response =
            check_status(response, |m| Error::Storage(format!("agent self: {}", m))).await?;

        let agent: AgentSelf = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("agent self: invalid response: {}", e)))?;
        Ok(agent.member.addr)
    }
}

/// Map a non-2xx response into the given error kind, keeping status + body.
async fn check_status(
    response: reqwest::Response,
    make_err: impl FnOnce(String) -> Error,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(make_err(format!("consul returned {}: {}", status, body)))
}
