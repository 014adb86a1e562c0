//! Kubernetes API integrations
//!
//! Pod ownership lookups, the cluster-wide pod watch loop and the
//! controller's prometheus metrics.

pub mod metrics;
pub mod pod_watcher;
pub mod pods;
