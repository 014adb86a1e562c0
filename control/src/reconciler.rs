//! Pod event reconciler
//!
//! Glue between the watch loop and the sync engine: resolve the event's pod
//! to a deployment, look up its targets, fetch its current pod IPs and sync.

use crate::apis::metrics;
use crate::apis::pod_watcher::{PodEvent, PodEventHandler};
use crate::apis::pods::PodResolver;
use crate::error::SyncError;
use crate::sync::{SyncEngine, SyncTrigger};
use async_trait::async_trait;
use common::DeploymentKey;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Reconciler {
    resolver: Arc<dyn PodResolver>,
    engine: SyncEngine,
}

impl Reconciler {
    pub fn new(resolver: Arc<dyn PodResolver>, engine: SyncEngine) -> Self {
        Self { resolver, engine }
    }
}

#[async_trait]
impl PodEventHandler for Reconciler {
    async fn handle(&self, event: &PodEvent) -> Result<(), SyncError> {
        let kind = event.kind.as_str();
        let pod_name = event.pod.name_any();
        let namespace = event.pod.namespace().unwrap_or_default();

        let deployment = self
            .resolver
            .deployment_of(&event.pod)
            .await?
            .filter(|name| !name.is_empty());
        let Some(deployment) = deployment else {
            trace!("Pod {}/{} has no owning deployment", namespace, pod_name);
            metrics::record_pod_event(kind, "unowned");
            return Ok(());
        };

        let key = DeploymentKey::new(namespace, deployment);
        let targets = self.engine.targets(&key).await;
        if targets.is_empty() {
            trace!("No load balancer targets for {}", key);
            metrics::record_pod_event(kind, "unconfigured");
            return Ok(());
        }

        let desired = self.resolver.pod_ips(&key).await?;
        let outcome = self
            .engine
            .sync(
                &key,
                &targets,
                &desired,
                SyncTrigger {
                    event: kind,
                    pod: &pod_name,
                },
            )
            .await;

        debug!("Synced {} after {} {}: {}", key, kind, pod_name, outcome);
        metrics::record_pod_event(kind, "synced");
        Ok(())
    }
}
