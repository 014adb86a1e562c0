//! Diff & Sync Engine
//!
//! Turns one observation of a deployment's pod IPs into register/deregister
//! calls for each of its ConfigTargets.
//!
//! ```text
//! additions = desired_ips - retained_ips                     (bare IPs)
//! removals  = (registered - desired@port) ∩ registered@other_ports
//! ```
//!
//! `retained_ips` is `registered_ips` minus IPs whose only registrations are
//! being removed in the same pass, so a pod that moves to a new port is
//! registered at the new port while its old entry is removed. Without any
//! removal it is exactly `registered_ips`.
//!
//! Removal only ever touches entries at a port other than the configured
//! one. A pod that disappears while registered at the configured port is
//! left registered by this path.
//!
//! Calls are fire-and-forget: a failed call is logged and counted, and the
//! next event or cache refresh converges again.

use crate::apis::metrics;
use crate::cache::ConfigCache;
use crate::cloud::LoadBalancerApi;
use common::{
    difference, intersection, sorted, BackendAddr, BackendKey, ConfigTarget, DeploymentKey,
    TargetRegistration,
};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

// =============================================================================
// SyncPlan
// =============================================================================

/// Addresses to register and deregister for one ConfigTarget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// New backends at the configured port, sorted
    pub additions: Vec<BackendAddr>,
    /// Stale-port backends, sorted
    pub removals: Vec<BackendAddr>,
}

impl SyncPlan {
    /// Diff desired pod IPs against what the cache says is registered
    ///
    /// `registered_ips` and `registered` describe the same backend group;
    /// `other_ports` is the subset of `registered` not at `port`.
    pub fn compute(
        desired: &HashSet<IpAddr>,
        port: u16,
        registered_ips: &HashSet<IpAddr>,
        registered: &HashSet<BackendAddr>,
        other_ports: &HashSet<BackendAddr>,
    ) -> Self {
        let desired_at_port: HashSet<BackendAddr> =
            desired.iter().map(|ip| BackendAddr::new(*ip, port)).collect();

        let stale = difference(registered, &desired_at_port);
        let removals = intersection(&stale, other_ports);

        let kept: HashSet<IpAddr> = difference(registered, &removals)
            .into_iter()
            .map(|addr| addr.ip)
            .collect();
        let moved: HashSet<IpAddr> = removals
            .iter()
            .map(|addr| addr.ip)
            .filter(|ip| !kept.contains(ip))
            .collect();
        let retained_ips = difference(registered_ips, &moved);

        let additions: HashSet<BackendAddr> = difference(desired, &retained_ips)
            .into_iter()
            .map(|ip| BackendAddr::new(ip, port))
            .collect();

        Self {
            additions: sorted(&additions),
            removals: sorted(&removals),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

// =============================================================================
// SyncEngine
// =============================================================================

/// What caused a sync, for the audit log
#[derive(Debug, Clone, Copy)]
pub struct SyncTrigger<'a> {
    pub event: &'a str,
    pub pod: &'a str,
}

/// Result of syncing one deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// ConfigTargets examined
    pub targets: usize,
    /// Addresses sent in successful register calls
    pub registered: usize,
    /// Addresses sent in successful deregister calls
    pub deregistered: usize,
    /// Register/deregister calls that failed
    pub failed_calls: usize,
}

impl SyncOutcome {
    pub fn is_noop(&self) -> bool {
        self.registered == 0 && self.deregistered == 0 && self.failed_calls == 0
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "targets={} registered={} deregistered={} failed_calls={}",
            self.targets, self.registered, self.deregistered, self.failed_calls
        )
    }
}

/// Drives register/deregister calls from cache state and observed pod IPs
pub struct SyncEngine {
    cache: Arc<ConfigCache>,
    api: Arc<dyn LoadBalancerApi>,
}

impl SyncEngine {
    pub fn new(cache: Arc<ConfigCache>, api: Arc<dyn LoadBalancerApi>) -> Self {
        Self { cache, api }
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    /// ConfigTargets of `deployment` (refreshes the cache when stale)
    pub async fn targets(&self, deployment: &DeploymentKey) -> Vec<ConfigTarget> {
        self.cache.get_targets(deployment).await
    }

    /// Plan for one ConfigTarget against the current cache snapshot
    pub fn plan(
        &self,
        deployment: &DeploymentKey,
        target: &ConfigTarget,
        desired: &HashSet<IpAddr>,
    ) -> SyncPlan {
        let key = BackendKey::new(deployment, target);

        SyncPlan::compute(
            desired,
            target.port,
            &self.cache.get_backend_ips(&key),
            &self.cache.get_backend_ip_ports(&key),
            &self.cache.get_backends_at_other_ports(&key, target.port),
        )
    }

    /// Converge every target of `deployment` towards `desired`
    ///
    /// Additions are registered before removals are deregistered, per
    /// target, in target order.
    pub async fn sync(
        &self,
        deployment: &DeploymentKey,
        targets: &[ConfigTarget],
        desired: &HashSet<IpAddr>,
        trigger: SyncTrigger<'_>,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome {
            targets: targets.len(),
            ..Default::default()
        };

        for target in targets {
            let plan = self.plan(deployment, target, desired);
            if plan.is_empty() {
                debug!(
                    "{} {}/{}/{} already in sync",
                    deployment, target.load_balancer_id, target.listener_id, target.location_id
                );
                continue;
            }

            if !plan.additions.is_empty() {
                info!(
                    "{} {} {} {} {} Adding new backend: {}",
                    deployment.namespace,
                    deployment.deployment,
                    trigger.event,
                    trigger.pod,
                    target.load_balancer_id,
                    join(&plan.additions)
                );

                let batch = registrations(target, &plan.additions);
                match self
                    .api
                    .batch_register_targets(&target.load_balancer_id, &batch)
                    .await
                {
                    Ok(()) => {
                        outcome.registered += batch.len();
                        metrics::record_sync_call("register", batch.len(), "success");
                    }
                    Err(e) => {
                        outcome.failed_calls += 1;
                        error!("Failed to register targets: {}", e);
                        metrics::record_sync_call("register", batch.len(), "error");
                    }
                }
            }

            if !plan.removals.is_empty() {
                info!(
                    "{} {} {} {} {} Removing old backend: {}",
                    deployment.namespace,
                    deployment.deployment,
                    trigger.event,
                    trigger.pod,
                    target.load_balancer_id,
                    join(&plan.removals)
                );

                let batch = registrations(target, &plan.removals);
                match self
                    .api
                    .batch_deregister_targets(&target.load_balancer_id, &batch)
                    .await
                {
                    Ok(()) => {
                        outcome.deregistered += batch.len();
                        metrics::record_sync_call("deregister", batch.len(), "success");
                    }
                    Err(e) => {
                        outcome.failed_calls += 1;
                        error!("Failed to deregister targets: {}", e);
                        metrics::record_sync_call("deregister", batch.len(), "error");
                    }
                }
            }
        }

        outcome
    }
}

fn registrations(target: &ConfigTarget, addrs: &[BackendAddr]) -> Vec<TargetRegistration> {
    addrs
        .iter()
        .map(|addr| TargetRegistration::for_target(target, *addr))
        .collect()
}

fn join(addrs: &[BackendAddr]) -> String {
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
