//! Consul Storage Backend
//!
//! Durable storage over Consul's KV store with built-in HA service
//! discovery: the backend executes key-value operations under bounded
//! concurrency and keeps this node's registration (role tag + health)
//! in sync with the cluster's view of it.

pub mod client;
pub mod discovery;

pub use client::{CheckStatus, ConsulClient, ServiceCheck, ServiceRegistration};
pub use discovery::{compute_tags, StateProbe};

use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use crate::permit::PermitPool;
use crate::redirect::RedirectAddress;
use crate::storage::{Entry, StorageBackend};
use async_trait::async_trait;
use discovery::ServiceSynchronizer;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// HA-aware storage backend over the Consul KV and agent APIs.
///
/// Each instance owns its own configuration, permit pool, and synchronizer
/// task; multiple instances never interfere with one another.
pub struct ConsulBackend {
    config: ConsulConfig,
    client: ConsulClient,
    permits: PermitPool,
    redirect: RwLock<Option<RedirectAddress>>,
    notify_active_tx: mpsc::Sender<()>,
    notify_sealed_tx: mpsc::Sender<()>,
    /// Taken exactly once by `run_service_discovery`.
    notify_rx: Mutex<Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>>,
}

impl ConsulBackend {
    /// Build a backend from the raw option map. Fails on any malformed
    /// option; a backend is never returned partially constructed.
    pub fn new(conf: &HashMap<String, String>) -> Result<Self> {
        let config = ConsulConfig::from_map(conf)?;
        let client = ConsulClient::new(&config);
        let permits = PermitPool::new(config.max_parallel);

        // Capacity-1 channels: rapid notifications coalesce into a single
        // pending wake instead of queuing without bound.
        let (notify_active_tx, active_rx) = mpsc::channel(1);
        let (notify_sealed_tx, sealed_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            client,
            permits,
            redirect: RwLock::new(None),
            notify_active_tx,
            notify_sealed_tx,
            notify_rx: Mutex::new(Some((active_rx, sealed_rx))),
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    /// Resolve and store the node's redirect address. On failure the
    /// previously stored address (if any) is left untouched.
    pub fn set_redirect_addr(&self, raw: &str) -> Result<()> {
        let addr = RedirectAddress::resolve(raw)?;
        *self.redirect.write() = Some(addr);
        Ok(())
    }

    /// Currently resolved redirect address.
    pub fn redirect_addr(&self) -> Option<RedirectAddress> {
        self.redirect.read().clone()
    }

    /// Stable identity this node registers under:
    /// `<service>:<host>:<port>`, or `<service>:<host>` for socket
    /// addresses. `None` until a redirect address has been set.
    pub fn service_id(&self) -> Option<String> {
        self.redirect.read().as_ref().map(|addr| {
            if addr.has_port() {
                format!("{}:{}:{}", self.config.service_name, addr.host, addr.port)
            } else {
                format!("{}:{}", self.config.service_name, addr.host)
            }
        })
    }

    /// Tag set that would be published for the given role.
    pub fn service_tags(&self, active: bool) -> Vec<String> {
        compute_tags(&self.config.service_tags, active)
    }

    /// Signal that this node's leadership role may have changed.
    /// Fire-and-forget: safe before startup and after shutdown, and
    /// rapid calls coalesce into one refresh.
    pub fn notify_active_change(&self) {
        let _ = self.notify_active_tx.try_send(());
    }

    /// Signal that this node's sealed state may have changed. Same
    /// semantics as [`Self::notify_active_change`].
    pub fn notify_sealed_change(&self) {
        let _ = self.notify_sealed_tx.try_send(());
    }

    /// This host's address as seen by the local agent, usable as a
    /// redirect address when none is configured.
    pub async fn detect_host_addr(&self) -> Result<String> {
        let _permit = self.permits.acquire().await;
        self.client.agent_self_addr().await
    }

    /// Start the registration/health synchronizer.
    ///
    /// Resolves `redirect_addr` (fatal on failure), registers under the
    /// derived identity, and keeps the registration in sync with the two
    /// probes until `shutdown` fires; the returned handle completes once
    /// the final best-effort deregistration is done. A no-op when
    /// registration is disabled by configuration.
    pub fn run_service_discovery(
        &self,
        redirect_addr: &str,
        active_probe: StateProbe,
        sealed_probe: StateProbe,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        if self.config.disable_registration {
            tracing::info!("service registration disabled, not synchronizing");
            return Ok(tokio::spawn(async {}));
        }

        self.set_redirect_addr(redirect_addr)?;
        let service_id = self.service_id().ok_or_else(|| {
            Error::AddressResolution(format!("cannot derive identity from {:?}", redirect_addr))
        })?;
        let address = self.redirect_addr().ok_or_else(|| {
            Error::AddressResolution(format!("no resolved address for {:?}", redirect_addr))
        })?;

        let (active_rx, sealed_rx) = self
            .notify_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Registration("service discovery already started".to_string()))?;

        let synchronizer = ServiceSynchronizer::new(
            self.client.clone(),
            self.permits.clone(),
            self.config.service_name.clone(),
            service_id,
            self.config.service_tags.clone(),
            self.config.check_timeout,
            address,
        );

        Ok(tokio::spawn(synchronizer.run(
            active_probe,
            sealed_probe,
            active_rx,
            sealed_rx,
            shutdown,
        )))
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.path, key)
    }
}

#[async_trait]
impl StorageBackend for ConsulBackend {
    async fn put(&self, entry: &Entry) -> Result<()> {
        let _permit = self.permits.acquire().await;
        self.client
            .kv_put(&self.full_key(&entry.key), &entry.value)
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        let _permit = self.permits.acquire().await;
        let value = self.client.kv_get(&self.full_key(key)).await?;
        Ok(value.map(|v| Entry::new(key, v)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _permit = self.permits.acquire().await;
        self.client.kv_delete(&self.full_key(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let scan = self.full_key(prefix);
        let _permit = self.permits.acquire().await;
        let keys = self.client.kv_keys(&scan, "/").await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&scan))
            .filter(|stripped| !stripped.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conf(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn backend_for(server: &MockServer) -> ConsulBackend {
        let address = server.uri().trim_start_matches("http://").to_string();
        ConsulBackend::new(&conf(&[("address", &address)])).unwrap()
    }

    fn probe(value: bool) -> StateProbe {
        Arc::new(move || value)
    }

    #[test]
    fn test_new_with_defaults() {
        let backend = ConsulBackend::new(&HashMap::new()).unwrap();
        assert_eq!(backend.config().path, "vault/");
        assert_eq!(backend.config().service_name, "vault");
        assert_eq!(backend.permits.capacity(), 4);
        assert!(backend.redirect_addr().is_none());
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(ConsulBackend::new(&conf(&[("check_timeout", "99ms")])).is_err());
        assert!(ConsulBackend::new(&conf(&[("max_parallel", "lots")])).is_err());
    }

    #[test]
    fn test_service_id_with_port() {
        let backend =
            ConsulBackend::new(&conf(&[("service", "sea-tech-astronomy")])).unwrap();

        for addr in ["http://127.0.0.1:8200", "http://127.0.0.1:8200/", "https://127.0.0.1:8200/"] {
            backend.set_redirect_addr(addr).unwrap();
            assert_eq!(
                backend.service_id().unwrap(),
                "sea-tech-astronomy:127.0.0.1:8200",
                "addr={}",
                addr
            );
        }
    }

    #[test]
    fn test_service_id_unix_socket_omits_port() {
        let backend = ConsulBackend::new(&HashMap::new()).unwrap();
        backend
            .set_redirect_addr("unix:///tmp/.vault.addr.sock")
            .unwrap();
        assert_eq!(backend.service_id().unwrap(), "vault:/tmp/.vault.addr.sock");
    }

    #[test]
    fn test_set_redirect_addr_failure_keeps_previous() {
        let backend = ConsulBackend::new(&HashMap::new()).unwrap();
        backend.set_redirect_addr("http://127.0.0.1:8200").unwrap();

        assert!(backend.set_redirect_addr("127.0.0.1:8201").is_err());

        let addr = backend.redirect_addr().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 8200);
    }

    #[test]
    fn test_service_tags_role() {
        let backend = ConsulBackend::new(&conf(&[(
            "service_tags",
            "deadbeef, cafeefac, deadc0de, feedface",
        )]))
        .unwrap();

        assert_eq!(
            backend.service_tags(false),
            vec!["deadbeef", "cafeefac", "deadc0de", "feedface", "standby"]
        );
        assert_eq!(
            backend.service_tags(true),
            vec!["deadbeef", "cafeefac", "deadc0de", "feedface", "active"]
        );
    }

    #[test]
    fn test_notify_before_start_is_noop() {
        let backend = ConsulBackend::new(&HashMap::new()).unwrap();
        // Nothing is running yet; triggers must be safe and silent.
        backend.notify_active_change();
        backend.notify_active_change();
        backend.notify_sealed_change();
        backend.notify_sealed_change();
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_run_disabled_registration_is_noop() {
        let backend =
            ConsulBackend::new(&conf(&[("disable_registration", "true")])).unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = backend
            .run_service_discovery("http://127.0.0.1:8200", probe(false), probe(false), shutdown_rx)
            .unwrap();
        handle.await.unwrap();
        assert!(logs_contain("service registration disabled"));
    }

    #[tokio::test]
    async fn test_run_bad_redirect_addr_is_fatal() {
        let backend = ConsulBackend::new(&HashMap::new()).unwrap();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = backend.run_service_discovery(
            "127.0.0.1:8200",
            probe(false),
            probe(false),
            shutdown_rx,
        );
        assert!(matches!(result, Err(Error::AddressResolution(_))));
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = backend
            .run_service_discovery(
                "http://127.0.0.1:8200",
                probe(false),
                probe(false),
                shutdown_tx.subscribe(),
            )
            .unwrap();

        let second = backend.run_service_discovery(
            "http://127.0.0.1:8200",
            probe(false),
            probe(false),
            shutdown_tx.subscribe(),
        );
        assert!(matches!(second, Err(Error::Registration(_))));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_put_prepends_path_prefix() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/v1/kv/vault/core/seal-config"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        backend
            .put(&Entry::new("core/seal-config", b"{}".to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_strips_path_prefix_from_entry() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/kv/vault/foo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Key": "vault/foo", "Value": "YmFy"}
            ])))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let entry = backend.get("foo").await.unwrap().unwrap();
        assert_eq!(entry.key, "foo");
        assert_eq!(entry.value, b"bar");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/kv/vault/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_uses_full_key() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/v1/kv/vault/foo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        backend.delete("foo").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_returns_relative_children() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/kv/vault/sub/"))
            .and(query_param("separator", "/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                "vault/sub/", "vault/sub/leaf", "vault/sub/tree/"
            ])))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let children = backend.list("sub/").await.unwrap();
        assert_eq!(children, vec!["leaf".to_string(), "tree/".to_string()]);
    }

    #[tokio::test]
    async fn test_list_empty_is_not_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/kv/vault/none/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        assert!(backend.list("none/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_error_propagates() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/v1/kv/vault/foo"))
            .respond_with(ResponseTemplate::new(500).set_body_string("leader lost"))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let err = backend
            .put(&Entry::new("foo", b"bar".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_detect_host_addr() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/agent/self"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Member": {"Addr": "192.168.1.10"}
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        assert_eq!(backend.detect_host_addr().await.unwrap(), "192.168.1.10");
    }
}
