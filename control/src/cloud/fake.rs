//! In-memory load balancer for unit tests
//!
//! Batch calls mutate the stored listener topology, so a describe after a
//! register/deregister reflects it the way the real control plane does.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::cloud::{LiveListener, LiveRule, LiveTarget, LoadBalancerApi};
use crate::error::SyncError;
use async_trait::async_trait;
use common::TargetRegistration;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register(String, Vec<TargetRegistration>),
    Deregister(String, Vec<TargetRegistration>),
}

#[derive(Default)]
pub struct FakeLoadBalancer {
    listeners: Mutex<HashMap<String, Vec<LiveListener>>>,
    failing: Mutex<HashSet<String>>,
    fail_batches: Mutex<bool>,
    describe_calls: Mutex<Vec<String>>,
    calls: Mutex<Vec<Call>>,
}

#[allow(clippy::unwrap_used)]
impl FakeLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listeners(self, load_balancer_id: &str, listeners: Vec<LiveListener>) -> Self {
        self.set_listeners(load_balancer_id, listeners);
        self
    }

    pub fn set_listeners(&self, load_balancer_id: &str, listeners: Vec<LiveListener>) {
        self.listeners
            .lock()
            .unwrap()
            .insert(load_balancer_id.to_string(), listeners);
    }

    /// Make describe calls for `load_balancer_id` fail
    pub fn fail_describe(&self, load_balancer_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(load_balancer_id.to_string());
    }

    pub fn fail_batches(&self, fail: bool) {
        *self.fail_batches.lock().unwrap() = fail;
    }

    pub fn describe_calls(&self) -> Vec<String> {
        self.describe_calls.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn with_rule<F>(&self, load_balancer_id: &str, target: &TargetRegistration, f: F)
    where
        F: FnOnce(&mut LiveRule),
    {
        let mut listeners = self.listeners.lock().unwrap();
        let rule = listeners
            .get_mut(load_balancer_id)
            .and_then(|ls| ls.iter_mut().find(|l| l.listener_id == target.listener_id))
            .and_then(|l| {
                l.rules
                    .iter_mut()
                    .find(|r| Some(&r.location_id) == target.location_id.as_ref())
            });
        if let Some(rule) = rule {
            f(rule);
        }
    }

    fn batch_result(&self, call: Call) -> Result<(), SyncError> {
        let action = match &call {
            Call::Register(..) => "BatchRegisterTargets",
            Call::Deregister(..) => "BatchDeregisterTargets",
        };
        self.calls.lock().unwrap().push(call);

        if *self.fail_batches.lock().unwrap() {
            return Err(SyncError::cloud(action, "InternalError", "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl LoadBalancerApi for FakeLoadBalancer {
    async fn describe_listeners(
        &self,
        load_balancer_id: &str,
    ) -> Result<Vec<LiveListener>, SyncError> {
        self.describe_calls
            .lock()
            .unwrap()
            .push(load_balancer_id.to_string());

        if self.failing.lock().unwrap().contains(load_balancer_id) {
            return Err(SyncError::cloud(
                "DescribeTargets",
                "ResourceNotFound",
                format!("{} not found", load_balancer_id),
            ));
        }

        Ok(self
            .listeners
            .lock()
            .unwrap()
            .get(load_balancer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn batch_register_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError> {
        let result = self.batch_result(Call::Register(
            load_balancer_id.to_string(),
            targets.to_vec(),
        ));
        if result.is_ok() {
            for target in targets {
                self.with_rule(load_balancer_id, target, |rule| {
                    rule.targets.push(LiveTarget {
                        port: target.port,
                        private_ip_addresses: vec![target.ip.to_string()],
                    });
                });
            }
        }
        result
    }

    async fn batch_deregister_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError> {
        let result = self.batch_result(Call::Deregister(
            load_balancer_id.to_string(),
            targets.to_vec(),
        ));
        if result.is_ok() {
            for target in targets {
                let addr = target.addr();
                self.with_rule(load_balancer_id, target, |rule| {
                    rule.targets.retain(|t| t.primary_addr() != Some(addr));
                });
            }
        }
        result
    }
}

/// HTTP listener with one rule per `(location_id, domain, url, targets)`
pub fn http_listener(
    listener_id: &str,
    port: u16,
    rules: Vec<(&str, &str, &str, Vec<(&str, u16)>)>,
) -> LiveListener {
    LiveListener {
        listener_id: listener_id.to_string(),
        port,
        protocol: "HTTP".to_string(),
        rules: rules
            .into_iter()
            .map(|(location_id, domain, url, targets)| LiveRule {
                location_id: location_id.to_string(),
                domain: domain.to_string(),
                url: url.to_string(),
                targets: targets
                    .into_iter()
                    .map(|(ip, port)| LiveTarget {
                        port,
                        private_ip_addresses: vec![ip.to_string()],
                    })
                    .collect(),
            })
            .collect(),
    }
}
