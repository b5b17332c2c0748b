//! Service Registration & Health Synchronizer
//!
//! Long-running task that keeps this node's service-discovery registration
//! in sync with its leadership role and sealed state. Wakes on a periodic
//! tick, on explicit state-change notifications, or on shutdown, whichever
//! comes first; at most one registration update is in flight at a time.
//!
//! A failing agent never takes the node down with it: registration errors
//! are logged and retried on the next wake, and the shutdown-time
//! deregistration is best-effort only.

use crate::consul::client::{
    ttl_string, CheckStatus, ConsulClient, ServiceCheck, ServiceRegistration,
};
use crate::permit::PermitPool;
use crate::redirect::RedirectAddress;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Leadership / sealed-state probe. Must return promptly; no blocking I/O.
pub type StateProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Role tag derived from the active probe.
const TAG_ACTIVE: &str = "active";
const TAG_STANDBY: &str = "standby";

/// Synchronizer lifecycle, for logging and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Starting,
    Registered,
    Deregistering,
}

/// Compute the published tag set: configured extra tags, order preserved,
/// with the role tag always appended last.
pub fn compute_tags(extra_tags: &[String], active: bool) -> Vec<String> {
    let mut tags = extra_tags.to_vec();
    tags.push(if active { TAG_ACTIVE } else { TAG_STANDBY }.to_string());
    tags
}

/// How often the loop wakes without an explicit notification. Kept well
/// inside the TTL window so the check never expires between refreshes.
pub(crate) fn reconcile_period(check_timeout: Duration) -> Duration {
    check_timeout.mul_f64(0.75)
}

pub(crate) struct ServiceSynchronizer {
    client: ConsulClient,
    permits: PermitPool,
    service_name: String,
    service_id: String,
    check_id: String,
    extra_tags: Vec<String>,
    check_timeout: Duration,
    address: RedirectAddress,
    /// Tag set of the last successful registration; `None` until the first
    /// register call goes through, so failures are retried with the same
    /// diff logic.
    published_tags: Option<Vec<String>>,
    state: SyncState,
}

impl ServiceSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: ConsulClient,
        permits: PermitPool,
        service_name: String,
        service_id: String,
        extra_tags: Vec<String>,
        check_timeout: Duration,
        address: RedirectAddress,
    ) -> Self {
        let check_id = format!("service:{}", service_id);
        Self {
            client,
            permits,
            service_name,
            service_id,
            check_id,
            extra_tags,
            check_timeout,
            address,
            published_tags: None,
            state: SyncState::Starting,
        }
    }

    /// Event demuxer: runs until the shutdown signal fires, then makes one
    /// best-effort deregistration attempt and exits.
    pub(crate) async fn run(
        mut self,
        active_probe: StateProbe,
        sealed_probe: StateProbe,
        mut active_rx: mpsc::Receiver<()>,
        mut sealed_rx: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let period = reconcile_period(self.check_timeout);
        let mut ticker = tokio::time::interval(period);
        tracing::info!(
            "service discovery started service_id={} period={:?}",
            self.service_id,
            period
        );

        loop {
            // The first tick fires immediately, so startup registration
            // goes through the same reconcile path as every later wake.
            tokio::select! {
                _ = ticker.tick() => {}
                Some(_) = active_rx.recv() => {
                    tracing::debug!("woken by active-state notification");
                }
                Some(_) = sealed_rx.recv() => {
                    tracing::debug!("woken by sealed-state notification");
                }
                _ = shutdown.recv() => break,
            }

            self.reconcile(active_probe(), sealed_probe()).await;
        }

        self.state = SyncState::Deregistering;
        tracing::info!("deregistering service_id={}", self.service_id);
        let _permit = self.permits.acquire().await;
        if let Err(e) = self.client.deregister_service(&self.service_id).await {
            tracing::warn!("best-effort deregistration failed: {}", e);
        }
    }

    /// Bring the agent's view in line with the probes. Service
    /// registration is re-sent only when the tag set changed; the TTL
    /// check is refreshed on every wake since it is the liveness signal.
    async fn reconcile(&mut self, active: bool, sealed: bool) {
        let tags = compute_tags(&self.extra_tags, active);
        let status = if sealed {
            CheckStatus::Warning
        } else {
            CheckStatus::Passing
        };

        if self.published_tags.as_ref() != Some(&tags) {
            let registration = ServiceRegistration {
                id: self.service_id.clone(),
                name: self.service_name.clone(),
                tags: tags.clone(),
                address: self.address.has_port().then(|| self.address.host.clone()),
                port: self
                    .address
                    .has_port()
                    .then_some(self.address.port as u16),
                check: ServiceCheck {
                    ttl: ttl_string(self.check_timeout),
                },
            };

            let _permit = self.permits.acquire().await;
            match self.client.register_service(&registration).await {
                Ok(()) => {
                    tracing::info!(
                        "registered service_id={} tags={:?}",
                        self.service_id,
                        tags
                    );
                    self.published_tags = Some(tags);
                    self.state = SyncState::Registered;
                }
                Err(e) => {
                    // Retried on the next wake; the node keeps serving.
                    tracing::warn!("service registration failed: {}", e);
                }
            }
        }

        // Refresh even when a re-registration just failed: the previous
        // registration is still live and its TTL check must not expire.
        if self.state == SyncState::Registered {
            let _permit = self.permits.acquire().await;
            if let Err(e) = self.client.update_check(&self.check_id, status).await {
                tracing::warn!("health check update failed: {}", e);
            }
        }
    }
}
