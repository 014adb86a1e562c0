//! Config Cache
//!
//! Cross-references the rules document with live listener state into two
//! indices:
//!
//! ```text
//! targets:  namespace/deployment                 -> [ConfigTarget]
//! backends: namespace/deployment/lb/listener/loc -> [BackendAddr]
//! ```
//!
//! Both are rebuilt off-lock on refresh and swapped in under one write lock.
//! Readers never see a half-built snapshot. Refresh is TTL gated: lookups
//! through [`ConfigCache::get_targets`] refresh a stale cache first, and a
//! refresh that fails still advances the timestamp so a broken rules file
//! or cloud API is retried at most once per TTL.

use crate::apis::metrics;
use crate::cloud::{resolve_http_listeners, LiveListener, LoadBalancerApi};
use crate::error::SyncError;
use crate::rules::{RuleDocument, RuleSource};
use common::{BackendAddr, BackendKey, ConfigTarget, DeploymentKey};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Safe RwLock read helper that recovers from poisoning
#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

// =============================================================================
// Indices
// =============================================================================

/// One immutable snapshot of the derived indices
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheIndices {
    targets: HashMap<DeploymentKey, Vec<ConfigTarget>>,
    backends: HashMap<BackendKey, Vec<BackendAddr>>,
}

impl CacheIndices {
    /// Match declared rules against live listeners
    ///
    /// `live` holds the HTTP/HTTPS listeners of every load balancer that
    /// resolved; load balancers missing from it contribute nothing.
    /// Listeners match on exact port and case-insensitive protocol, rules
    /// on exact domain and URL. Declarations with no live counterpart are
    /// dropped.
    pub fn build(doc: &RuleDocument, live: &HashMap<String, Vec<LiveListener>>) -> Self {
        let mut indices = Self::default();

        for lb in doc.load_balancers() {
            let Some(listeners) = live.get(&lb.load_balancer_id) else {
                continue;
            };

            for declared in &lb.listeners {
                let matching = listeners.iter().filter(|l| {
                    l.port == declared.port && l.protocol.eq_ignore_ascii_case(&declared.protocol)
                });

                for listener in matching {
                    for path_rule in &declared.rules {
                        let deployment = path_rule.backend.deployment_key();

                        for rule in listener
                            .rules
                            .iter()
                            .filter(|r| r.domain == path_rule.domain && r.url == path_rule.url)
                        {
                            let target = ConfigTarget {
                                load_balancer_id: lb.load_balancer_id.clone(),
                                listener_id: listener.listener_id.clone(),
                                location_id: rule.location_id.clone(),
                                port: path_rule.backend.port,
                            };

                            let backends: Vec<BackendAddr> =
                                rule.targets.iter().filter_map(|t| t.primary_addr()).collect();
                            if !backends.is_empty() {
                                indices
                                    .backends
                                    .insert(BackendKey::new(&deployment, &target), backends);
                            }

                            trace!(
                                "Matched {} -> {}/{}/{} port {}",
                                deployment,
                                target.load_balancer_id,
                                target.listener_id,
                                target.location_id,
                                target.port
                            );

                            indices
                                .targets
                                .entry(deployment.clone())
                                .or_default()
                                .push(target);
                        }
                    }
                }
            }
        }

        indices
    }

    pub fn targets(&self, key: &DeploymentKey) -> &[ConfigTarget] {
        self.targets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn backends(&self, key: &BackendKey) -> &[BackendAddr] {
        self.backends.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total ConfigTargets across all deployments
    pub fn target_count(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    /// Number of backend groups with at least one registered address
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

impl fmt::Display for CacheIndices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheIndices {{ deployments: {}, targets: {}, backends: {} }}",
            self.targets.len(),
            self.target_count(),
            self.backend_count()
        )
    }
}

// =============================================================================
// ConfigCache
// =============================================================================

#[derive(Debug, Default)]
struct CacheState {
    indices: CacheIndices,
    last_refresh: Option<Instant>,
}

/// TTL-refreshed mapping from deployments to load balancer targets
///
/// Shared by `Arc` between the watch loop and the background refresher.
pub struct ConfigCache {
    rules: Arc<dyn RuleSource>,
    api: Arc<dyn LoadBalancerApi>,
    ttl: Duration,
    state: RwLock<CacheState>,
    /// Serializes refreshes; never held together with `state`
    refresh_gate: tokio::sync::Mutex<()>,
}

impl ConfigCache {
    pub fn new(rules: Arc<dyn RuleSource>, api: Arc<dyn LoadBalancerApi>, ttl: Duration) -> Self {
        Self {
            rules,
            api,
            ttl,
            state: RwLock::new(CacheState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True if never refreshed or the TTL has elapsed
    pub fn is_stale(&self) -> bool {
        match safe_read(&self.state).last_refresh {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Refresh if stale, no-op otherwise
    ///
    /// Concurrent callers that find the cache stale wait for the first one
    /// and then see it fresh, so one TTL window costs one resolver pass.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        if !self.is_stale() {
            return Ok(());
        }

        let _gate = self.refresh_gate.lock().await;
        if !self.is_stale() {
            return Ok(());
        }

        self.reload().await
    }

    /// Refresh regardless of the TTL
    pub async fn force_refresh(&self) -> Result<(), SyncError> {
        let _gate = self.refresh_gate.lock().await;
        self.reload().await
    }

    async fn reload(&self) -> Result<(), SyncError> {
        let start = Instant::now();

        let doc = match self.rules.load().await {
            Ok(doc) => doc,
            Err(e) => {
                // Keep the previous indices, but back off for a full TTL
                self.mark_refreshed();
                error!("Failed to load rules, keeping previous config: {}", e);
                metrics::record_cache_refresh(start.elapsed().as_secs_f64(), "rules_error");
                return Err(e);
            }
        };

        if doc.is_empty() {
            warn!("Rules document declares no load balancers");
        }

        let mut live = HashMap::new();
        let mut attempted: HashSet<&str> = HashSet::new();
        let mut failed = 0usize;
        for lb in doc.load_balancers() {
            if !attempted.insert(lb.load_balancer_id.as_str()) {
                continue;
            }
            match resolve_http_listeners(self.api.as_ref(), &lb.load_balancer_id).await {
                Ok(listeners) => {
                    live.insert(lb.load_balancer_id.clone(), listeners);
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        "Failed to get listeners for load balancer {}: {}",
                        lb.load_balancer_id, e
                    );
                    metrics::record_listener_resolve_failure(&lb.load_balancer_id);
                }
            }
        }

        let indices = CacheIndices::build(&doc, &live);
        let summary = indices.to_string();
        let target_count = indices.target_count();

        {
            let mut state = safe_write(&self.state);
            state.indices = indices;
            state.last_refresh = Some(Instant::now());
        }

        let result = if failed == 0 { "success" } else { "partial" };
        metrics::record_cache_refresh(start.elapsed().as_secs_f64(), result);
        metrics::set_cache_targets(target_count);

        info!(
            "Config loaded: {} ({} declared backends, {} load balancers, {} failed)",
            summary,
            doc.declared_backends(),
            attempted.len(),
            failed
        );

        Ok(())
    }

    fn mark_refreshed(&self) {
        safe_write(&self.state).last_refresh = Some(Instant::now());
    }

    /// ConfigTargets of a deployment, refreshing first if stale
    ///
    /// A failed refresh is logged and the previous snapshot is served.
    pub async fn get_targets(&self, key: &DeploymentKey) -> Vec<ConfigTarget> {
        if let Err(e) = self.refresh().await {
            warn!("Serving stale config for {}: {}", key, e);
        }

        safe_read(&self.state).indices.targets(key).to_vec()
    }

    /// Registered IPs of a backend group (ports ignored)
    pub fn get_backend_ips(&self, key: &BackendKey) -> HashSet<IpAddr> {
        safe_read(&self.state)
            .indices
            .backends(key)
            .iter()
            .map(|b| b.ip)
            .collect()
    }

    /// Registered `ip:port` pairs of a backend group
    pub fn get_backend_ip_ports(&self, key: &BackendKey) -> HashSet<BackendAddr> {
        safe_read(&self.state)
            .indices
            .backends(key)
            .iter()
            .copied()
            .collect()
    }

    /// Registered `ip:port` pairs whose port differs from `exclude_port`
    pub fn get_backends_at_other_ports(
        &self,
        key: &BackendKey,
        exclude_port: u16,
    ) -> HashSet<BackendAddr> {
        safe_read(&self.state)
            .indices
            .backends(key)
            .iter()
            .filter(|b| b.port != exclude_port)
            .copied()
            .collect()
    }

    pub fn target_count(&self) -> usize {
        safe_read(&self.state).indices.target_count()
    }

    pub fn backend_count(&self) -> usize {
        safe_read(&self.state).indices.backend_count()
    }

    /// Copy of the current indices
    pub fn snapshot(&self) -> CacheIndices {
        safe_read(&self.state).indices.clone()
    }
}

/// Refresh `cache` every TTL until `shutdown` is cancelled
///
/// Keeps listener state fresh for deployments that see no pod events.
pub fn spawn_refresher(cache: Arc<ConfigCache>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cache.ttl());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = cache.refresh().await {
                        warn!("Background config refresh failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Config refresher stopped");
                    break;
                }
            }
        }
    })
}
