//! lbsync Common Types
//!
//! Keys, resolved load-balancer targets and backend addresses shared by the
//! config cache and the sync engine, plus the pure set helpers the backend
//! diff is built on.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};

// =============================================================================
// Keys
// =============================================================================

/// Deployment lookup key: (namespace, deployment)
///
/// Displays as `namespace/deployment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentKey {
    pub namespace: String,
    pub deployment: String,
}

impl DeploymentKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployment: deployment.into(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.deployment)
    }
}

/// Composite key identifying one backend group on a load balancer
///
/// (namespace, deployment, load balancer, listener, location). Displays as
/// the five parts joined with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey {
    pub namespace: String,
    pub deployment: String,
    pub load_balancer_id: String,
    pub listener_id: String,
    pub location_id: String,
}

impl BackendKey {
    /// Key for the backends of `target` bound to `deployment`
    pub fn new(deployment: &DeploymentKey, target: &ConfigTarget) -> Self {
        Self {
            namespace: deployment.namespace.clone(),
            deployment: deployment.deployment.clone(),
            load_balancer_id: target.load_balancer_id.clone(),
            listener_id: target.listener_id.clone(),
            location_id: target.location_id.clone(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.namespace,
            self.deployment,
            self.load_balancer_id,
            self.listener_id,
            self.location_id
        )
    }
}

// =============================================================================
// Targets and backends
// =============================================================================

/// A declared backend bound to a live listener/rule pair
///
/// Only exists while both the declaration and the live listener rule exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigTarget {
    pub load_balancer_id: String,
    pub listener_id: String,
    /// Forwarding rule id (empty for listeners without rules)
    pub location_id: String,
    /// Backend port the deployment's pods should be registered at
    pub port: u16,
}

/// A registered (or desired) backend endpoint: IP + port
///
/// Displays as `ip:port` (`[ip]:port` for IPv6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl BackendAddr {
    #[inline]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

/// One entry of a batch register/deregister call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRegistration {
    pub listener_id: String,
    /// Omitted from the call when the target has no forwarding rule
    pub location_id: Option<String>,
    pub port: u16,
    pub ip: IpAddr,
}

impl TargetRegistration {
    /// Registration of `addr` against the listener/rule of `target`
    pub fn for_target(target: &ConfigTarget, addr: BackendAddr) -> Self {
        let location_id = if target.location_id.is_empty() {
            None
        } else {
            Some(target.location_id.clone())
        };

        Self {
            listener_id: target.listener_id.clone(),
            location_id,
            port: addr.port,
            ip: addr.ip,
        }
    }

    /// The endpoint this registration points at
    pub fn addr(&self) -> BackendAddr {
        BackendAddr::new(self.ip, self.port)
    }
}

// =============================================================================
// Set helpers
// =============================================================================

/// Elements of `a` that are not in `b`
///
/// Duplicates in `a` collapse; the result does not depend on input order.
pub fn difference<'a, T, I>(a: I, b: &HashSet<T>) -> HashSet<T>
where
    T: Eq + Hash + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    a.into_iter().filter(|x| !b.contains(*x)).cloned().collect()
}

/// Elements of `a` that are also in `b`
///
/// Duplicates in `a` collapse; the result does not depend on input order.
pub fn intersection<'a, T, I>(a: I, b: &HashSet<T>) -> HashSet<T>
where
    T: Eq + Hash + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    a.into_iter().filter(|x| b.contains(*x)).cloned().collect()
}

/// Sorted copy of a set, for deterministic API calls and log lines
pub fn sorted<T: Ord + Clone>(set: &HashSet<T>) -> Vec<T> {
    let mut items: Vec<T> = set.iter().cloned().collect();
    items.sort();
    items
}
