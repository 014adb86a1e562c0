//! Cloud load balancer integration
//!
//! `LoadBalancerApi` is the seam between the reconciliation engine and the
//! provider's control plane. The engine only ever needs three calls: read a
//! load balancer's listener topology, and batch register/deregister targets.

#[cfg(test)]
pub(crate) mod fake;
pub mod signer;
pub mod tencent;

use crate::error::SyncError;
use async_trait::async_trait;
use common::{BackendAddr, TargetRegistration};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Snapshot of one live listener and its forwarding rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveListener {
    pub listener_id: String,
    pub port: u16,
    pub protocol: String,
    pub rules: Vec<LiveRule>,
}

impl LiveListener {
    /// Only HTTP/HTTPS listeners carry domain/URL forwarding rules
    pub fn is_http(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("HTTP") || self.protocol.eq_ignore_ascii_case("HTTPS")
    }
}

/// Live forwarding rule (location) with its registered targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRule {
    pub location_id: String,
    pub domain: String,
    pub url: String,
    pub targets: Vec<LiveTarget>,
}

/// Registered target as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTarget {
    pub port: u16,
    pub private_ip_addresses: Vec<String>,
}

impl LiveTarget {
    /// Backend address from the first private IP
    ///
    /// Returns None when the target has no private IP or it does not parse.
    pub fn primary_addr(&self) -> Option<BackendAddr> {
        let raw = self.private_ip_addresses.first()?;
        match raw.parse::<IpAddr>() {
            Ok(ip) => Some(BackendAddr::new(ip, self.port)),
            Err(_) => {
                warn!("Ignoring registered target with invalid IP address {}", raw);
                None
            }
        }
    }
}

/// Cloud load balancer control plane
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// All listeners of a load balancer, with rules and registered targets
    async fn describe_listeners(&self, load_balancer_id: &str)
        -> Result<Vec<LiveListener>, SyncError>;

    async fn batch_register_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError>;

    async fn batch_deregister_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError>;
}

/// Resolve a load balancer's HTTP/HTTPS listeners
///
/// Listeners of any other protocol are dropped and never matched.
pub async fn resolve_http_listeners(
    api: &dyn LoadBalancerApi,
    load_balancer_id: &str,
) -> Result<Vec<LiveListener>, SyncError> {
    let listeners = api.describe_listeners(load_balancer_id).await?;
    let total = listeners.len();

    let http: Vec<LiveListener> = listeners.into_iter().filter(LiveListener::is_http).collect();

    debug!(
        "Load balancer {}: {} listeners, {} HTTP/HTTPS",
        load_balancer_id,
        total,
        http.len()
    );

    Ok(http)
}
