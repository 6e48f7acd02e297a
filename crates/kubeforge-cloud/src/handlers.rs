//! Queue handlers for cluster and machine lifecycle tasks
//!
//! | Task         | Payload             | Runs                           |
//! |--------------|---------------------|--------------------------------|
//! | `CreateKube` | `{"kubeID": "..."}` | kube provisioning, inline      |
//! | `DeleteKube` | `{"kubeID": "..."}` | kube teardown, inline          |
//! | `CreateNode` | `{"nodeID": "..."}` | node provisioning, inline      |
//! | `DeleteNode` | `{"nodeID": "..."}` | node teardown, inline          |
//!
//! Each handler runs its action to completion so a failure goes back to the
//! queue and is retried. A record that no longer exists counts as done.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{CloudError, Result};
use crate::task::TaskType;
use crate::worker::{HandlerRegistry, TaskHandler};

#[derive(Debug, Deserialize)]
struct KubeRef {
    #[serde(rename = "kubeID")]
    kube_id: String,
}

#[derive(Debug, Deserialize)]
struct NodeRef {
    #[serde(rename = "nodeID")]
    node_id: String,
}

fn payload<T: serde::de::DeserializeOwned>(task_type: TaskType, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| CloudError::InvalidConfig(format!("bad {} payload: {}", task_type, e)))
}

/// `Ok(None)` when the record is gone
fn existing<M>(result: Result<M>) -> Result<Option<M>> {
    match result {
        Ok(model) => Ok(Some(model)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub struct CreateKubeHandler(pub Engine);

#[async_trait]
impl TaskHandler for CreateKubeHandler {
    async fn handle(&self, data: Value) -> Result<()> {
        let KubeRef { kube_id } = payload(TaskType::CreateKube, data)?;
        let kubes = self.0.kubes();
        let Some(kube) = existing(kubes.get(&kube_id).await)? else {
            tracing::info!("Kube {} no longer exists; nothing to provision", kube_id);
            return Ok(());
        };
        if kube.ready {
            return Ok(());
        }
        kubes.provision(kube).await?.now().await
    }
}

pub struct DeleteKubeHandler(pub Engine);

#[async_trait]
impl TaskHandler for DeleteKubeHandler {
    async fn handle(&self, data: Value) -> Result<()> {
        let KubeRef { kube_id } = payload(TaskType::DeleteKube, data)?;
        let kubes = self.0.kubes();
        let Some(kube) = existing(kubes.get(&kube_id).await)? else {
            tracing::info!("Kube {} already deleted", kube_id);
            return Ok(());
        };
        kubes.delete(kube).now().await
    }
}

pub struct CreateNodeHandler(pub Engine);

#[async_trait]
impl TaskHandler for CreateNodeHandler {
    async fn handle(&self, data: Value) -> Result<()> {
        let NodeRef { node_id } = payload(TaskType::CreateNode, data)?;
        let nodes = self.0.nodes();
        let Some(node) = existing(nodes.get(&node_id).await)? else {
            tracing::info!("Node {} no longer exists; nothing to provision", node_id);
            return Ok(());
        };
        if !node.provider_id.is_empty() && !node.external_ip.is_empty() {
            return Ok(());
        }
        nodes.provision(node).await?.now().await
    }
}

pub struct DeleteNodeHandler(pub Engine);

#[async_trait]
impl TaskHandler for DeleteNodeHandler {
    async fn handle(&self, data: Value) -> Result<()> {
        let NodeRef { node_id } = payload(TaskType::DeleteNode, data)?;
        let nodes = self.0.nodes();
        let Some(node) = existing(nodes.get(&node_id).await)? else {
            tracing::info!("Node {} already deleted", node_id);
            return Ok(());
        };
        nodes.delete(node).now().await
    }
}

/// Handlers for every task type the engine itself can serve
pub fn registry(engine: &Engine) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(TaskType::CreateKube, CreateKubeHandler(engine.clone()))
        .with(TaskType::DeleteKube, DeleteKubeHandler(engine.clone()))
        .with(TaskType::CreateNode, CreateNodeHandler(engine.clone()))
        .with(TaskType::DeleteNode, DeleteNodeHandler(engine.clone()))
}
