//! lbsync Control Plane Library
//!
//! Keeps cloud load balancer backends in sync with the pods of Kubernetes
//! Deployments. The `lbsync` binary wires these modules together; tests and
//! tools can drive them directly with their own trait implementations.

pub mod apis;
pub mod cache;
pub mod cloud;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod rules;
pub mod shutdown;
pub mod sync;
