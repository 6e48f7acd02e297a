//! Minimal Kubernetes API client
//!
//! Only what provisioning and node observation need: listing nodes and
//! reading heapster node metrics. All clients share one injected
//! `reqwest::Client` so connections are reused across operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CloudError, Result};
use crate::model::Kube;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

/// A node as reported by the Kubernetes API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeNode {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

impl KubeNode {
    pub fn external_ip(&self) -> Option<&str> {
        self.status
            .addresses
            .iter()
            .find(|a| a.address_type == "ExternalIP")
            .map(|a| a.address.as_str())
    }

    /// `Some(true)` if the `OutOfDisk` condition is set
    pub fn out_of_disk(&self) -> Option<bool> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == "OutOfDisk")
            .map(|c| c.status == "True")
    }
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<KubeNode>,
}

/// Usage sample from heapster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapsterMetric {
    pub name: String,
    #[serde(rename = "cpuUsage")]
    pub cpu_usage: i64,
    #[serde(rename = "memUsage")]
    pub ram_usage: i64,
}

/// Read access to one cluster's API
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<KubeNode>>;

    async fn list_node_metrics(&self) -> Result<Vec<HeapsterMetric>>;
}

/// Produces API clients for kubes
pub trait KubernetesConnector: Send + Sync {
    fn connect(&self, kube: &Kube) -> Arc<dyn KubernetesApi>;
}

/// Connector backed by a shared HTTP client
#[derive(Clone)]
pub struct HttpKubernetesConnector {
    client: reqwest::Client,
}

impl HttpKubernetesConnector {
    /// Build a connector with its own client.
    ///
    /// Cluster masters serve self-signed certificates, so verification is off.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl KubernetesConnector for HttpKubernetesConnector {
    fn connect(&self, kube: &Kube) -> Arc<dyn KubernetesApi> {
        Arc::new(HttpKubernetesClient {
            client: self.client.clone(),
            base_url: format!("https://{}/api/v1", kube.master_public_ip),
            username: kube.username.clone(),
            password: kube.password.clone(),
        })
    }
}

pub struct HttpKubernetesClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpKubernetesClient {
    async fn request_into<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Provider(format!("K8S {} error", status)));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl KubernetesApi for HttpKubernetesClient {
    async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
        let list: NodeList = self.request_into("nodes").await?;
        Ok(list.items)
    }

    async fn list_node_metrics(&self) -> Result<Vec<HeapsterMetric>> {
        self.request_into("proxy/namespaces/kube-system/services/heapster/api/v1/model/nodes")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_status_parsing() {
        let list: NodeList = serde_json::from_value(json!({
            "items": [{
                "metadata": {"name": "prod-minion-1"},
                "status": {
                    "addresses": [
                        {"type": "InternalIP", "address": "10.0.0.2"},
                        {"type": "ExternalIP", "address": "203.0.113.9"}
                    ],
                    "conditions": [
                        {"type": "Ready", "status": "True"},
                        {"type": "OutOfDisk", "status": "False"}
                    ]
                }
            }]
        }))
        .unwrap();

        let node = &list.items[0];
        assert_eq!(node.external_ip(), Some("203.0.113.9"));
        assert_eq!(node.out_of_disk(), Some(false));
    }

    #[test]
    fn test_heapster_metric_names() {
        let metric: HeapsterMetric =
            serde_json::from_value(json!({"name": "n1", "cpuUsage": 250, "memUsage": 1024}))
                .unwrap();
        assert_eq!(metric.cpu_usage, 250);
        assert_eq!(metric.ram_usage, 1024);
    }
}
