//! Shared engine state

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::action::ActionRuntime;
use crate::collection::Collection;
use crate::error::Result;
use crate::kubernetes::{HttpKubernetesConnector, KubernetesApi, KubernetesConnector};
use crate::model::{CloudAccount, Kube};
use crate::provider::{CloudProvider, NodeSize, ProviderContext, ProviderKind, ProviderRegistry};
use crate::resources::{EntrypointListeners, Entrypoints, Kubes, Nodes, Volumes};
use crate::store::EntityStore;
use crate::task::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, TaskCollection};

struct EngineInner {
    store: Arc<dyn EntityStore>,
    actions: ActionRuntime,
    tasks: TaskCollection,
    providers: ProviderRegistry,
    kubernetes: Arc<dyn KubernetesConnector>,
    node_sizes: HashMap<ProviderKind, Vec<NodeSize>>,
}

/// Entry point to collections, actions and providers.
///
/// Cheap to clone; every clone shares one store and one action registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(store: Arc<dyn EntityStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            providers: ProviderRegistry::new(),
            kubernetes: None,
            node_sizes: HashMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.inner.store
    }

    pub fn actions(&self) -> &ActionRuntime {
        &self.inner.actions
    }

    pub fn tasks(&self) -> &TaskCollection {
        &self.inner.tasks
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn cloud_accounts(&self) -> Collection<CloudAccount> {
        Collection::new(self.store().clone())
    }

    pub fn kubes(&self) -> Kubes {
        Kubes::new(self.clone())
    }

    pub fn nodes(&self) -> Nodes {
        Nodes::new(self.clone())
    }

    pub fn volumes(&self) -> Volumes {
        Volumes::new(self.clone())
    }

    pub fn entrypoints(&self) -> Entrypoints {
        Entrypoints::new(self.clone())
    }

    pub fn entrypoint_listeners(&self) -> EntrypointListeners {
        EntrypointListeners::new(self.clone())
    }

    /// Kubernetes API client for a provisioned kube
    pub fn kubernetes(&self, kube: &Kube) -> Arc<dyn KubernetesApi> {
        self.inner.kubernetes.connect(kube)
    }

    /// Node sizes offered by a provider; empty when none are configured
    pub fn node_sizes(&self, kind: ProviderKind) -> &[NodeSize] {
        self.inner
            .node_sizes
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve the provider behind a cloud account
    pub async fn provider_for(
        &self,
        cloud_account_id: &str,
    ) -> Result<(Arc<dyn CloudProvider>, ProviderContext)> {
        let account = self.cloud_accounts().get(cloud_account_id).await?;
        let provider = self.providers().get(account.provider)?;
        Ok((
            provider,
            ProviderContext {
                engine: self.clone(),
                account,
            },
        ))
    }
}

pub struct EngineBuilder {
    store: Arc<dyn EntityStore>,
    providers: ProviderRegistry,
    kubernetes: Option<Arc<dyn KubernetesConnector>>,
    node_sizes: HashMap<ProviderKind, Vec<NodeSize>>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl EngineBuilder {
    pub fn provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    pub fn kubernetes(mut self, connector: Arc<dyn KubernetesConnector>) -> Self {
        self.kubernetes = Some(connector);
        self
    }

    pub fn node_sizes(mut self, kind: ProviderKind, sizes: Vec<NodeSize>) -> Self {
        self.node_sizes.insert(kind, sizes);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let kubernetes = match self.kubernetes {
            Some(connector) => connector,
            None => Arc::new(HttpKubernetesConnector::new()?),
        };
        Ok(Engine {
            inner: Arc::new(EngineInner {
                actions: ActionRuntime::new(self.store.clone()),
                tasks: TaskCollection::new(self.store.clone())
                    .with_max_attempts(self.max_attempts)
                    .with_retry_delay(self.retry_delay),
                store: self.store,
                providers: self.providers,
                kubernetes,
                node_sizes: self.node_sizes,
            }),
        })
    }
}
