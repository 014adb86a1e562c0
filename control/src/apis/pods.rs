//! Pod Resolver
//!
//! Maps a pod to its owning Deployment and lists a Deployment's pod IPs.
//! Ownership is resolved exactly one level deep:
//!
//! ```text
//! Pod --ownerRef(ReplicaSet)--> ReplicaSet --ownerRef(Deployment)--> Deployment
//! ```
//!
//! Pods owned by anything else (StatefulSet, DaemonSet, Job, bare pods) are
//! unresolved and skipped by the caller.

use crate::error::SyncError;
use async_trait::async_trait;
use common::DeploymentKey;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, trace, warn};

/// Cluster lookups the reconciler needs
#[async_trait]
pub trait PodResolver: Send + Sync {
    /// Name of the Deployment that owns `pod`, if any
    async fn deployment_of(&self, pod: &Pod) -> Result<Option<String>, SyncError>;

    /// IPs of the Deployment's pods that currently have one
    async fn pod_ips(&self, deployment: &DeploymentKey) -> Result<HashSet<IpAddr>, SyncError>;
}

/// Name of the first owner of kind `kind`
fn owner_of_kind<'a>(owners: Option<&'a [OwnerReference]>, kind: &str) -> Option<&'a str> {
    owners?
        .iter()
        .find(|owner| owner.kind == kind)
        .map(|owner| owner.name.as_str())
}

/// Owning ReplicaSet of a pod
pub fn replica_set_owner(pod: &Pod) -> Option<&str> {
    owner_of_kind(pod.metadata.owner_references.as_deref(), "ReplicaSet")
}

/// Owning Deployment of a ReplicaSet
pub fn deployment_owner(replica_set: &ReplicaSet) -> Option<&str> {
    owner_of_kind(
        replica_set.metadata.owner_references.as_deref(),
        "Deployment",
    )
}

/// Pod IP, if assigned and valid
pub fn pod_ip(pod: &Pod) -> Option<IpAddr> {
    let raw = pod
        .status
        .as_ref()?
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())?;

    match raw.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            warn!("Ignoring pod {} with invalid IP {}", pod.name_any(), raw);
            None
        }
    }
}

/// Render a label selector in list-query syntax
///
/// `matchLabels` become `k=v`; `matchExpressions` become `k in (a,b)`,
/// `k notin (a,b)`, `k` or `!k`. Returns None for an empty selector,
/// which would otherwise match every pod in the namespace.
pub fn render_selector(selector: &LabelSelector) -> Option<String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default().join(",");
        let part = match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values),
            "NotIn" => format!("{} notin ({})", expr.key, values),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                warn!(
                    "Ignoring selector expression on {} with unknown operator {}",
                    expr.key, other
                );
                continue;
            }
        };
        parts.push(part);
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// PodResolver backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePodResolver {
    client: Client,
}

impl KubePodResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodResolver for KubePodResolver {
    async fn deployment_of(&self, pod: &Pod) -> Result<Option<String>, SyncError> {
        let Some(rs_name) = replica_set_owner(pod) else {
            trace!("Pod {} has no ReplicaSet owner", pod.name_any());
            return Ok(None);
        };
        let namespace = pod.namespace().unwrap_or_default();

        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &namespace);
        let Some(replica_set) = api.get_opt(rs_name).await? else {
            debug!("ReplicaSet {}/{} not found", namespace, rs_name);
            return Ok(None);
        };

        Ok(deployment_owner(&replica_set).map(str::to_string))
    }

    async fn pod_ips(&self, deployment: &DeploymentKey) -> Result<HashSet<IpAddr>, SyncError> {
        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), &deployment.namespace);
        let Some(found) = deployments.get_opt(&deployment.deployment).await? else {
            debug!("Deployment {} not found", deployment);
            return Ok(HashSet::new());
        };

        let selector = found
            .spec
            .as_ref()
            .and_then(|spec| render_selector(&spec.selector));
        let Some(selector) = selector else {
            warn!("Deployment {} has an empty selector, skipping", deployment);
            return Ok(HashSet::new());
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &deployment.namespace);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        let ips: HashSet<IpAddr> = list.items.iter().filter_map(pod_ip).collect();
        debug!(
            "Deployment {} ({}): {} pods, {} with IPs",
            deployment,
            selector,
            list.items.len(),
            ips.len()
        );

        Ok(ips)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelectorRequirement, ObjectMeta};
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{}", name),
            ..Default::default()
        }
    }

    fn pod(owners: Vec<OwnerReference>, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app-7d9f-abcde".to_string()),
                namespace: Some("prod".to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_replica_set_owner() {
        let p = pod(
            vec![owner("Node", "n1"), owner("ReplicaSet", "app-7d9f")],
            None,
        );
        assert_eq!(replica_set_owner(&p), Some("app-7d9f"));
    }

    #[test]
    fn test_non_replica_set_owners_are_unresolved() {
        assert_eq!(replica_set_owner(&pod(vec![owner("StatefulSet", "db")], None)), None);
        assert_eq!(replica_set_owner(&pod(vec![owner("DaemonSet", "agent")], None)), None);
        assert_eq!(replica_set_owner(&pod(vec![], None)), None);

        let mut bare = pod(vec![], None);
        bare.metadata.owner_references = None;
        assert_eq!(replica_set_owner(&bare), None);
    }

    #[test]
    fn test_deployment_owner() {
        let rs = ReplicaSet {
            metadata: ObjectMeta {
                name: Some("app-7d9f".to_string()),
                owner_references: Some(vec![owner("Deployment", "app")]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(deployment_owner(&rs), Some("app"));

        let orphan = ReplicaSet::default();
        assert_eq!(deployment_owner(&orphan), None);
    }

    #[test]
    fn test_pod_ip() {
        assert_eq!(
            pod_ip(&pod(vec![], Some("10.0.0.5"))),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
        );
        assert_eq!(pod_ip(&pod(vec![], Some(""))), None, "Pending pods have no IP");
        assert_eq!(pod_ip(&pod(vec![], None)), None);
        assert_eq!(pod_ip(&pod(vec![], Some("bogus"))), None);
        assert_eq!(pod_ip(&Pod::default()), None, "Pod without status");
    }

    #[test]
    fn test_render_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("tier".to_string(), "web".to_string()),
                ("app".to_string(), "api".to_string()),
            ])),
            match_expressions: None,
        };
        assert_eq!(
            render_selector(&selector).as_deref(),
            Some("app=api,tier=web"),
            "Labels render in key order"
        );
    }

    #[test]
    fn test_render_match_expressions() {
        let requirement = |key: &str, op: &str, values: Option<Vec<&str>>| LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: values.map(|vs| vs.into_iter().map(str::to_string).collect()),
        };

        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "api".to_string())])),
            match_expressions: Some(vec![
                requirement("env", "In", Some(vec!["prod", "staging"])),
                requirement("track", "NotIn", Some(vec!["canary"])),
                requirement("owner", "Exists", None),
                requirement("legacy", "DoesNotExist", None),
                requirement("weird", "Near", Some(vec!["x"])),
            ]),
        };

        assert_eq!(
            render_selector(&selector).as_deref(),
            Some("app=api,env in (prod,staging),track notin (canary),owner,!legacy")
        );
    }

    #[test]
    fn test_render_empty_selector() {
        assert_eq!(render_selector(&LabelSelector::default()), None);
    }
}
