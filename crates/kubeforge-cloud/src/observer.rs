//! Periodic node status reconciliation

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{CloudError, Result};
use crate::model::{Kube, Model};

/// Copies live node state from each ready kube's Kubernetes API into the
/// stored node records
pub struct NodeObserver {
    engine: Engine,
}

impl NodeObserver {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// One reconciliation pass over every ready kube.
    ///
    /// A kube whose API or account cannot be read is logged and skipped so
    /// the remaining kubes are still observed.
    pub async fn perform(&self) -> Result<()> {
        let kubes = self.engine.kubes().collection().find(|k| k.ready).await?;

        for kube in kubes {
            if let Err(e) = self.observe_kube(&kube).await {
                tracing::warn!("Failed to observe kube {} ({}): {}", kube.name, kube.id, e);
            }
        }
        Ok(())
    }

    async fn observe_kube(&self, kube: &Kube) -> Result<()> {
        let account = self
            .engine
            .cloud_accounts()
            .get(&kube.cloud_account_id)
            .await?;
        let sizes = self.engine.node_sizes(account.provider);

        let known = self
            .engine
            .nodes()
            .collection()
            .find(|n| n.kube_id == kube.id && !n.provider_id.is_empty())
            .await?;

        let k8s = self.engine.kubernetes(kube);
        let metrics = k8s.list_node_metrics().await?;
        let k8s_nodes = k8s.list_nodes().await?;

        let store = self.engine.store();
        let registry = self.engine.actions().registry();

        for mut node in known {
            // the running action owns the record until it finishes
            if registry.is_running(&node.uuid) {
                tracing::debug!("Skipping {}: action in progress", node.name);
                continue;
            }

            let observed = serde_json::to_value(&node)?;
            if let Some(k8s_node) = k8s_nodes.iter().find(|k| k.metadata.name == node.name) {
                if let Some(ip) = k8s_node.external_ip() {
                    node.external_ip = ip.to_string();
                }
                if let Some(out_of_disk) = k8s_node.out_of_disk() {
                    node.out_of_disk = out_of_disk;
                }
            }

            match sizes.iter().find(|s| s.name == node.size) {
                Some(size) => {
                    node.cpu_limit = size.cpu_millicores();
                    node.ram_limit = size.ram_bytes();
                }
                None => tracing::debug!("No size info for {} ({})", node.name, node.size),
            }

            match metrics.iter().find(|m| m.name == node.name) {
                Some(metric) => {
                    node.cpu_usage = metric.cpu_usage;
                    node.ram_usage = metric.ram_usage;
                }
                None => tracing::debug!("No metrics for {}", node.name),
            }

            let next = serde_json::to_value(&node)?;
            if next == observed {
                continue;
            }
            match store.compare_and_swap(&node.key(), &observed, next).await {
                Ok(()) => {}
                Err(CloudError::NotFound(_)) => {
                    tracing::debug!("Node {} was deleted while observing", node.name);
                }
                Err(CloudError::Conflict(_)) => {
                    tracing::debug!("Node {} changed while observing", node.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run `perform` every `interval` until cancelled
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!("Node observer started (every {:?})", interval);
        loop {
            if let Err(e) = self.perform().await {
                tracing::warn!("Node observer pass failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Node observer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{
        HeapsterMetric, KubeNode, KubernetesApi, KubernetesConnector, NodeAddress, NodeCondition,
        NodeStatus, ObjectMeta,
    };
    use crate::model::{CloudAccount, Node};
    use crate::provider::{NodeSize, ProviderKind};
    use crate::store::{EntityStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FakeKubernetes;

    #[async_trait]
    impl KubernetesApi for FakeKubernetes {
        async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
            Ok(vec![KubeNode {
                metadata: ObjectMeta {
                    name: "prod-minion-a".to_string(),
                },
                status: NodeStatus {
                    addresses: vec![NodeAddress {
                        address_type: "ExternalIP".to_string(),
                        address: "203.0.113.4".to_string(),
                    }],
                    conditions: vec![NodeCondition {
                        condition_type: "OutOfDisk".to_string(),
                        status: "True".to_string(),
                    }],
                },
            }])
        }

        async fn list_node_metrics(&self) -> Result<Vec<HeapsterMetric>> {
            Ok(vec![HeapsterMetric {
                name: "prod-minion-a".to_string(),
                cpu_usage: 120,
                ram_usage: 4096,
            }])
        }
    }

    impl KubernetesConnector for FakeKubernetes {
        fn connect(&self, _kube: &Kube) -> Arc<dyn KubernetesApi> {
            Arc::new(FakeKubernetes)
        }
    }

    fn sizes() -> Vec<NodeSize> {
        vec![NodeSize {
            name: "s-1vcpu-2gb".to_string(),
            cpu_cores: 1.0,
            ram_gib: 2.0,
        }]
    }

    fn engine_with(kubernetes: Arc<dyn KubernetesConnector>) -> Engine {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        Engine::builder(store)
            .kubernetes(kubernetes)
            .node_sizes(ProviderKind::DigitalOcean, sizes())
            .build()
            .unwrap()
    }

    async fn ready_kube(engine: &Engine, name: &str) -> Kube {
        let mut account = CloudAccount {
            name: "do".to_string(),
            ..Default::default()
        };
        engine.cloud_accounts().create(&mut account).await.unwrap();

        let mut kube = Kube::new(name, account.id.clone());
        kube.ready = true;
        engine.kubes().collection().create(&mut kube).await.unwrap();
        kube
    }

    async fn provisioned_node(engine: &Engine, kube: &Kube, name: &str) -> Node {
        let mut node = Node::new(kube.id.clone(), "s-1vcpu-2gb");
        node.name = name.to_string();
        node.provider_id = "101".to_string();
        engine.nodes().collection().create(&mut node).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_perform_updates_provisioned_nodes() {
        let engine = engine_with(Arc::new(FakeKubernetes));
        let kube = ready_kube(&engine, "prod").await;

        let provisioned = provisioned_node(&engine, &kube, "prod-minion-a").await;
        let mut pending = Node::new(kube.id.clone(), "unknown-size");
        pending.name = "prod-minion-b".to_string();
        let nodes = engine.nodes();
        nodes.collection().create(&mut pending).await.unwrap();

        NodeObserver::new(engine.clone()).perform().await.unwrap();

        let updated = nodes.get(&provisioned.id).await.unwrap();
        assert_eq!(updated.external_ip, "203.0.113.4");
        assert!(updated.out_of_disk);
        assert_eq!(updated.cpu_usage, 120);
        assert_eq!(updated.ram_usage, 4096);
        assert_eq!(updated.cpu_limit, 1000);
        assert_eq!(updated.ram_limit, 2_147_483_648);

        // nodes without a provider id are left alone
        let untouched = nodes.get(&pending.id).await.unwrap();
        assert!(untouched.external_ip.is_empty());
        assert_eq!(untouched.cpu_limit, 0);
    }

    #[tokio::test]
    async fn test_perform_skips_nodes_with_running_action() {
        let engine = engine_with(Arc::new(FakeKubernetes));
        let kube = ready_kube(&engine, "prod").await;
        let node = provisioned_node(&engine, &kube, "prod-minion-a").await;

        let guard = engine
            .actions()
            .registry()
            .acquire(&node.uuid, false)
            .await
            .unwrap();
        NodeObserver::new(engine.clone()).perform().await.unwrap();
        let untouched = engine.nodes().get(&node.id).await.unwrap();
        assert!(untouched.external_ip.is_empty());
        assert_eq!(untouched.cpu_usage, 0);

        drop(guard);
        NodeObserver::new(engine.clone()).perform().await.unwrap();
        let updated = engine.nodes().get(&node.id).await.unwrap();
        assert_eq!(updated.external_ip, "203.0.113.4");
    }

    /// Fails for the kube named "broken", otherwise behaves like `FakeKubernetes`
    struct PartlyBroken;

    struct BrokenApi;

    #[async_trait]
    impl KubernetesApi for BrokenApi {
        async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
            Err(CloudError::Provider("connection refused".to_string()))
        }

        async fn list_node_metrics(&self) -> Result<Vec<HeapsterMetric>> {
            Err(CloudError::Provider("connection refused".to_string()))
        }
    }

    impl KubernetesConnector for PartlyBroken {
        fn connect(&self, kube: &Kube) -> Arc<dyn KubernetesApi> {
            if kube.name == "broken" {
                Arc::new(BrokenApi)
            } else {
                Arc::new(FakeKubernetes)
            }
        }
    }

    #[tokio::test]
    async fn test_perform_continues_past_failing_kube() {
        let engine = engine_with(Arc::new(PartlyBroken));
        let broken = ready_kube(&engine, "broken").await;
        let mut orphaned = Kube::new("orphaned", "no-such-account");
        orphaned.ready = true;
        engine.kubes().collection().create(&mut orphaned).await.unwrap();
        let healthy = ready_kube(&engine, "prod").await;

        let stuck = provisioned_node(&engine, &broken, "prod-minion-a").await;
        let node = provisioned_node(&engine, &healthy, "prod-minion-a").await;

        NodeObserver::new(engine.clone()).perform().await.unwrap();

        let updated = engine.nodes().get(&node.id).await.unwrap();
        assert_eq!(updated.external_ip, "203.0.113.4");
        assert_eq!(updated.cpu_usage, 120);
        let stuck = engine.nodes().get(&stuck.id).await.unwrap();
        assert!(stuck.external_ip.is_empty());
    }

    /// Deletes one node record while the observer is talking to Kubernetes
    #[derive(Clone)]
    struct DeletesNode {
        store: Arc<dyn EntityStore>,
        key: Arc<parking_lot::Mutex<Option<String>>>,
    }

    #[async_trait]
    impl KubernetesApi for DeletesNode {
        async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
            let key = self.key.lock().take();
            if let Some(key) = key {
                self.store.delete(&key).await?;
            }
            FakeKubernetes.list_nodes().await
        }

        async fn list_node_metrics(&self) -> Result<Vec<HeapsterMetric>> {
            FakeKubernetes.list_node_metrics().await
        }
    }

    impl KubernetesConnector for DeletesNode {
        fn connect(&self, _kube: &Kube) -> Arc<dyn KubernetesApi> {
            Arc::new(self.clone())
        }
    }

    #[tokio::test]
    async fn test_perform_skips_node_deleted_mid_pass() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let deletes = DeletesNode {
            store: store.clone(),
            key: Arc::new(parking_lot::Mutex::new(None)),
        };
        let engine = Engine::builder(store)
            .kubernetes(Arc::new(deletes.clone()))
            .node_sizes(ProviderKind::DigitalOcean, sizes())
            .build()
            .unwrap();
        let kube = ready_kube(&engine, "prod").await;
        let doomed = provisioned_node(&engine, &kube, "prod-minion-a").await;
        let survivor = provisioned_node(&engine, &kube, "prod-minion-c").await;
        *deletes.key.lock() = Some(doomed.key());

        NodeObserver::new(engine.clone()).perform().await.unwrap();

        assert!(engine.nodes().get(&doomed.id).await.unwrap_err().is_not_found());
        let updated = engine.nodes().get(&survivor.id).await.unwrap();
        assert_eq!(updated.cpu_limit, 1000);
    }
}
