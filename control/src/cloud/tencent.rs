//! Tencent Cloud CLB client
//!
//! Speaks the CLB API (version 2018-03-17) directly over HTTPS:
//! `DescribeTargets`, `BatchRegisterTargets` and `BatchDeregisterTargets`.
//! Requests are JSON POSTs signed with TC3-HMAC-SHA256.

use crate::cloud::signer::{self, Credential, SigningRequest};
use crate::cloud::{LiveListener, LiveRule, LiveTarget, LoadBalancerApi};
use crate::config::CloudConfig;
use crate::error::SyncError;
use async_trait::async_trait;
use common::TargetRegistration;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, error, warn};

const SERVICE: &str = "clb";
const API_VERSION: &str = "2018-03-17";

const SECRET_ID_ENV: &str = "CLOUD_TENCENT_SECRET_ID";
const SECRET_KEY_ENV: &str = "CLOUD_TENCENT_SECRET_KEY";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetsRequest<'a> {
    load_balancer_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetsResponse {
    #[serde(default)]
    listeners: Option<Vec<ListenerDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenerDto {
    listener_id: String,
    protocol: String,
    port: i64,
    #[serde(default)]
    rules: Option<Vec<RuleDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RuleDto {
    location_id: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    targets: Option<Vec<TargetDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetDto {
    port: i64,
    #[serde(default)]
    private_ip_addresses: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchTargetsRequest<'a> {
    load_balancer_id: &'a str,
    targets: Vec<BatchTarget>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchTarget {
    listener_id: String,
    port: i64,
    eni_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BatchTargetsResponse {
    #[serde(default)]
    fail_listener_id_set: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

impl From<&TargetRegistration> for BatchTarget {
    fn from(target: &TargetRegistration) -> Self {
        Self {
            listener_id: target.listener_id.clone(),
            port: i64::from(target.port),
            eni_ip: target.ip.to_string(),
            location_id: target.location_id.clone(),
        }
    }
}

fn port_from_wire(port: i64, what: &str) -> Option<u16> {
    match u16::try_from(port) {
        Ok(port) => Some(port),
        Err(_) => {
            warn!("Ignoring {} with out-of-range port {}", what, port);
            None
        }
    }
}

impl DescribeTargetsResponse {
    fn into_listeners(self) -> Vec<LiveListener> {
        self.listeners
            .unwrap_or_default()
            .into_iter()
            .filter_map(|listener| {
                let port = port_from_wire(listener.port, "listener")?;
                let rules = listener
                    .rules
                    .unwrap_or_default()
                    .into_iter()
                    .map(|rule| LiveRule {
                        location_id: rule.location_id,
                        domain: rule.domain.unwrap_or_default(),
                        url: rule.url.unwrap_or_default(),
                        targets: rule
                            .targets
                            .unwrap_or_default()
                            .into_iter()
                            .filter_map(|target| {
                                Some(LiveTarget {
                                    port: port_from_wire(target.port, "target")?,
                                    private_ip_addresses: target
                                        .private_ip_addresses
                                        .unwrap_or_default(),
                                })
                            })
                            .collect(),
                    })
                    .collect();

                Some(LiveListener {
                    listener_id: listener.listener_id,
                    port,
                    protocol: listener.protocol,
                    rules,
                })
            })
            .collect()
    }
}

/// Split the `Response` envelope into the action payload or an API error
fn decode_response<T: DeserializeOwned>(action: &str, body: &str) -> Result<T, SyncError> {
    let mut envelope: serde_json::Value = serde_json::from_str(body)?;
    let response = envelope
        .get_mut("Response")
        .map(serde_json::Value::take)
        .ok_or_else(|| SyncError::cloud(action, "InvalidResponse", "missing Response field"))?;

    if let Some(err) = response.get("Error") {
        let err: ApiError = serde_json::from_value(err.clone())?;
        let request_id = response
            .get("RequestId")
            .and_then(|id| id.as_str())
            .unwrap_or("-");
        error!(
            "An API error has returned for {} (request {}): [{}] {}",
            action, request_id, err.code, err.message
        );
        return Err(SyncError::cloud(action, err.code, err.message));
    }

    Ok(serde_json::from_value(response)?)
}

// =============================================================================
// Client
// =============================================================================

/// CLB API client
pub struct TencentClbClient {
    http: reqwest::Client,
    credential: Credential,
    region: String,
    endpoint: String,
}

impl TencentClbClient {
    pub fn new(config: &CloudConfig, credential: Credential) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            credential,
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        })
    }

    /// Build a client with credentials from `CLOUD_TENCENT_SECRET_ID` /
    /// `CLOUD_TENCENT_SECRET_KEY`
    pub fn from_env(config: &CloudConfig) -> Result<Self, SyncError> {
        let secret_id = env::var(SECRET_ID_ENV).unwrap_or_default();
        let secret_key = env::var(SECRET_KEY_ENV).unwrap_or_default();

        if secret_id.is_empty() || secret_key.is_empty() {
            return Err(SyncError::Config(format!(
                "{} and {} must be set",
                SECRET_ID_ENV, SECRET_KEY_ENV
            )));
        }

        Self::new(config, Credential::new(secret_id, secret_key))
    }

    fn headers(&self, action: &str, payload: &str) -> Result<HeaderMap, SyncError> {
        let timestamp = chrono::Utc::now().timestamp();
        let date = chrono::DateTime::from_timestamp(timestamp, 0)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .ok_or_else(|| SyncError::Config(format!("invalid clock timestamp {}", timestamp)))?;

        let authorization = signer::authorization(
            &self.credential,
            &SigningRequest {
                service: SERVICE,
                host: &self.endpoint,
                timestamp,
                date: &date,
                payload,
            },
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&authorization)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(signer::CONTENT_TYPE));
        headers.insert(HOST, header_value(&self.endpoint)?);
        headers.insert("X-TC-Action", header_value(action)?);
        headers.insert("X-TC-Timestamp", header_value(&timestamp.to_string())?);
        headers.insert("X-TC-Version", HeaderValue::from_static(API_VERSION));
        headers.insert("X-TC-Region", header_value(&self.region)?);
        Ok(headers)
    }

    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, SyncError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_string(request)?;
        let headers = self.headers(action, &payload)?;

        debug!("Calling CLB {} ({} bytes)", action, payload.len());

        let response = self
            .http
            .post(format!("https://{}/", self.endpoint))
            .headers(headers)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::cloud(
                action,
                format!("HTTP{}", status.as_u16()),
                body,
            ));
        }

        decode_response(action, &body)
    }

    async fn batch(
        &self,
        action: &str,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError> {
        let request = BatchTargetsRequest {
            load_balancer_id,
            targets: targets.iter().map(BatchTarget::from).collect(),
        };

        let response: BatchTargetsResponse = self.call(action, &request).await?;

        // Partial success: the call succeeded but some listeners rejected targets
        if let Some(failed) = response.fail_listener_id_set.filter(|set| !set.is_empty()) {
            warn!(
                "{} on {}: listeners rejected targets: {}",
                action,
                load_balancer_id,
                failed.join(", ")
            );
        }

        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SyncError> {
    HeaderValue::from_str(value)
        .map_err(|e| SyncError::Config(format!("invalid header value {:?}: {}", value, e)))
}

#[async_trait]
impl LoadBalancerApi for TencentClbClient {
    async fn describe_listeners(
        &self,
        load_balancer_id: &str,
    ) -> Result<Vec<LiveListener>, SyncError> {
        let response: DescribeTargetsResponse = self
            .call("DescribeTargets", &DescribeTargetsRequest { load_balancer_id })
            .await?;

        Ok(response.into_listeners())
    }

    async fn batch_register_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError> {
        self.batch("BatchRegisterTargets", load_balancer_id, targets)
            .await
    }

    async fn batch_deregister_targets(
        &self,
        load_balancer_id: &str,
        targets: &[TargetRegistration],
    ) -> Result<(), SyncError> {
        self.batch("BatchDeregisterTargets", load_balancer_id, targets)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const DESCRIBE_TARGETS_BODY: &str = r#"{
      "Response": {
        "Listeners": [
          {
            "ListenerId": "lbl-http",
            "Protocol": "HTTP",
            "Port": 80,
            "Targets": null,
            "Rules": [
              {
                "LocationId": "loc-1",
                "Domain": "api.example.com",
                "Url": "/",
                "Targets": [
                  {
                    "Type": "ENI",
                    "InstanceId": "",
                    "Port": 8080,
                    "Weight": 10,
                    "PublicIpAddresses": null,
                    "PrivateIpAddresses": ["10.0.0.5"],
                    "EniId": "eni-1",
                    "RegisteredTime": "2024-01-01 00:00:00"
                  }
                ]
              },
              {
                "LocationId": "loc-2",
                "Domain": "api.example.com",
                "Url": "/admin",
                "Targets": null
              }
            ]
          },
          {
            "ListenerId": "lbl-tcp",
            "Protocol": "TCP",
            "Port": 3306,
            "Rules": null
          }
        ],
        "RequestId": "req-1"
      }
    }"#;

    #[test]
    fn test_decode_describe_targets() {
        let response: DescribeTargetsResponse =
            decode_response("DescribeTargets", DESCRIBE_TARGETS_BODY).expect("Should decode");
        let listeners = response.into_listeners();

        assert_eq!(listeners.len(), 2);

        let http = &listeners[0];
        assert_eq!(http.listener_id, "lbl-http");
        assert_eq!(http.port, 80);
        assert_eq!(http.rules.len(), 2);
        assert_eq!(http.rules[0].location_id, "loc-1");
        assert_eq!(http.rules[0].url, "/");
        assert_eq!(http.rules[0].targets[0].port, 8080);
        assert_eq!(
            http.rules[0].targets[0].private_ip_addresses,
            vec!["10.0.0.5".to_string()]
        );
        assert!(http.rules[1].targets.is_empty(), "null Targets decode to empty");

        let tcp = &listeners[1];
        assert_eq!(tcp.protocol, "TCP");
        assert!(tcp.rules.is_empty(), "null Rules decode to empty");
    }

    #[test]
    fn test_decode_api_error() {
        let body = r#"{
          "Response": {
            "Error": { "Code": "AuthFailure.SignatureFailure", "Message": "signature mismatch" },
            "RequestId": "req-2"
          }
        }"#;

        let result: Result<DescribeTargetsResponse, _> = decode_response("DescribeTargets", body);
        match result {
            Err(SyncError::Cloud {
                action,
                code,
                message,
            }) => {
                assert_eq!(action, "DescribeTargets");
                assert_eq!(code, "AuthFailure.SignatureFailure");
                assert_eq!(message, "signature mismatch");
            }
            other => panic!("Expected cloud error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_envelope() {
        let result: Result<DescribeTargetsResponse, _> = decode_response("DescribeTargets", "{}");
        assert!(matches!(result, Err(SyncError::Cloud { .. })));
    }

    #[test]
    fn test_out_of_range_ports_are_skipped() {
        let body = r#"{"Response": {"Listeners": [
            {"ListenerId": "lbl-bad", "Protocol": "HTTP", "Port": 70000, "Rules": []},
            {"ListenerId": "lbl-ok", "Protocol": "HTTP", "Port": 80, "Rules": [
                {"LocationId": "loc-1", "Domain": "a", "Url": "/", "Targets": [
                    {"Port": -1, "PrivateIpAddresses": ["10.0.0.1"]},
                    {"Port": 8080, "PrivateIpAddresses": ["10.0.0.2"]}
                ]}
            ]}
        ], "RequestId": "req-3"}}"#;

        let response: DescribeTargetsResponse =
            decode_response("DescribeTargets", body).expect("Should decode");
        let listeners = response.into_listeners();

        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].listener_id, "lbl-ok");
        assert_eq!(listeners[0].rules[0].targets.len(), 1);
        assert_eq!(listeners[0].rules[0].targets[0].port, 8080);
    }

    #[test]
    fn test_batch_request_wire_format() {
        let targets = vec![
            TargetRegistration {
                listener_id: "lbl-1".to_string(),
                location_id: Some("loc-1".to_string()),
                port: 8080,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            },
            TargetRegistration {
                listener_id: "lbl-2".to_string(),
                location_id: None,
                port: 9090,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)),
            },
        ];
        let request = BatchTargetsRequest {
            load_balancer_id: "lb-1",
            targets: targets.iter().map(BatchTarget::from).collect(),
        };

        let json = serde_json::to_value(&request).expect("Should serialize");
        assert_eq!(json["LoadBalancerId"], "lb-1");
        assert_eq!(json["Targets"][0]["ListenerId"], "lbl-1");
        assert_eq!(json["Targets"][0]["LocationId"], "loc-1");
        assert_eq!(json["Targets"][0]["Port"], 8080);
        assert_eq!(json["Targets"][0]["EniIp"], "10.0.0.5");
        assert!(
            json["Targets"][1].get("LocationId").is_none(),
            "Absent location must be omitted, not sent as null"
        );
    }

    #[test]
    fn test_decode_batch_response_with_failures() {
        let body = r#"{"Response": {"FailListenerIdSet": ["lbl-1"], "RequestId": "req-4"}}"#;
        let response: BatchTargetsResponse =
            decode_response("BatchRegisterTargets", body).expect("Should decode");
        assert_eq!(response.fail_listener_id_set, Some(vec!["lbl-1".to_string()]));
    }

    #[test]
    fn test_headers_are_signed() {
        let client = TencentClbClient::new(
            &CloudConfig::default(),
            Credential::new("AKIDEXAMPLE", "secret"),
        )
        .expect("Should build client");

        let headers = client
            .headers("DescribeTargets", "{}")
            .expect("Should build headers");

        assert_eq!(headers["X-TC-Action"], "DescribeTargets");
        assert_eq!(headers["X-TC-Version"], "2018-03-17");
        assert_eq!(headers["X-TC-Region"], "ap-beijing");
        assert_eq!(headers[HOST], "clb.tencentcloudapi.com");
        assert!(headers[AUTHORIZATION]
            .to_str()
            .unwrap()
            .starts_with("TC3-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }
}
