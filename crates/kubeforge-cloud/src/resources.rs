//! Resource collections and their provisioning actions
//!
//! Creating a resource persists its record first and then provisions it on
//! the provider through an action. Deleting returns an [`Action`] so callers
//! decide whether to run it inline or in the background.

use std::sync::Arc;

use crate::action::Action;
use crate::collection::Collection;
use crate::engine::Engine;
use crate::error::{CloudError, Result};
use crate::model::{Entrypoint, EntrypointListener, Kube, Node, Volume};
use crate::provider::{CloudProvider, ProviderContext};

const KUBE_PROVISION_RETRIES: u32 = 20;
const PROVISION_RETRIES: u32 = 5;
const DELETE_RETRIES: u32 = 5;

/// Random lowercase hex string of at most 32 characters
pub(crate) fn random_string(len: usize) -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(len)
        .collect()
}

/// A provider that cannot create a resource kind has nothing to tear down
fn tolerate_unsupported(result: Result<()>, what: &str) -> Result<()> {
    match result {
        Err(CloudError::Unsupported(reason)) => {
            tracing::warn!("Skipping provider cleanup of {}: {}", what, reason);
            Ok(())
        }
        other => other,
    }
}

pub struct Kubes {
    engine: Engine,
    collection: Collection<Kube>,
}

impl Kubes {
    pub(crate) fn new(engine: Engine) -> Self {
        let collection = Collection::new(engine.store().clone());
        Self { engine, collection }
    }

    pub fn collection(&self) -> &Collection<Kube> {
        &self.collection
    }

    pub async fn get(&self, id: &str) -> Result<Kube> {
        self.collection.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Kube>> {
        self.collection.list().await
    }

    /// Persist a kube and start provisioning it in the background.
    ///
    /// API credentials are generated when neither is set. The kube becomes
    /// `ready` once the provider reports a working cluster.
    pub async fn create(&self, kube: &mut Kube) -> Result<()> {
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;

        if kube.username.is_empty() && kube.password.is_empty() {
            kube.username = random_string(16);
            kube.password = random_string(8);
        }
        self.collection.create(kube).await?;

        self.provisioning(kube.clone(), provider, ctx).run_async().await
    }

    /// Provisioning action for a stored kube.
    ///
    /// Re-running it resumes the provider's procedure from its last
    /// checkpoint.
    pub async fn provision(&self, kube: Kube) -> Result<Action<Kube>> {
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;
        Ok(self.provisioning(kube, provider, ctx))
    }

    fn provisioning(
        &self,
        kube: Kube,
        provider: Arc<dyn CloudProvider>,
        ctx: ProviderContext,
    ) -> Action<Kube> {
        self.engine
            .actions()
            .action(kube)
            .description("provisioning")
            .max_retries(KUBE_PROVISION_RETRIES)
            .run(move |action, kube| {
                Box::pin(async move {
                    provider.create_kube(&ctx, kube, action).await?;
                    kube.ready = true;
                    Ok(())
                })
            })
    }

    /// Tear down a kube and everything that belongs to it.
    ///
    /// Supersedes any provisioning still running on the kube.
    pub fn delete(&self, kube: Kube) -> Action<Kube> {
        let engine = self.engine.clone();
        let id = kube.id.clone();
        self.engine
            .actions()
            .action(kube)
            .description("deleting")
            .max_retries(DELETE_RETRIES)
            .target_id(id)
            .cancel_existing(true)
            .scope(|store, kube| {
                Box::pin(async move { Collection::<Kube>::new(store).get(&kube.id).await })
            })
            .run(move |_, kube| {
                Box::pin(async move {
                    let entrypoints = engine.entrypoints();
                    for entrypoint in entrypoints
                        .collection()
                        .find(|e| e.kube_id == kube.id)
                        .await?
                    {
                        entrypoints.delete(entrypoint).now().await?;
                    }

                    let nodes = engine.nodes();
                    for node in nodes.collection().find(|n| n.kube_id == kube.id).await? {
                        nodes.delete(node).now().await?;
                    }

                    let volumes = engine.volumes();
                    for volume in volumes.collection().find(|v| v.kube_id == kube.id).await? {
                        volumes.delete(volume).now().await?;
                    }

                    let (provider, ctx) = engine.provider_for(&kube.cloud_account_id).await?;
                    provider.delete_kube(&ctx, kube).await?;
                    engine.kubes().collection().delete(kube).await
                })
            })
    }
}

pub struct Nodes {
    engine: Engine,
    collection: Collection<Node>,
}

impl Nodes {
    pub(crate) fn new(engine: Engine) -> Self {
        let collection = Collection::new(engine.store().clone());
        Self { engine, collection }
    }

    pub fn collection(&self) -> &Collection<Node> {
        &self.collection
    }

    pub async fn get(&self, id: &str) -> Result<Node> {
        self.collection.get(id).await
    }

    /// Persist a node and provision its machine in the background
    pub async fn create(&self, node: &mut Node) -> Result<()> {
        let kube = self.engine.kubes().get(&node.kube_id).await?;
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;

        if node.name.is_empty() {
            node.name = format!("{}-minion-{}", kube.name, random_string(5));
        }
        self.collection.create(node).await?;

        self.provisioning(node.clone(), kube, provider, ctx)
            .run_async()
            .await
    }

    /// Provisioning action for a stored node
    pub async fn provision(&self, node: Node) -> Result<Action<Node>> {
        let kube = self.engine.kubes().get(&node.kube_id).await?;
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;
        Ok(self.provisioning(node, kube, provider, ctx))
    }

    fn provisioning(
        &self,
        node: Node,
        kube: Kube,
        provider: Arc<dyn CloudProvider>,
        ctx: ProviderContext,
    ) -> Action<Node> {
        self.engine
            .actions()
            .action(node)
            .description("provisioning")
            .max_retries(PROVISION_RETRIES)
            .run(move |action, node| {
                Box::pin(async move { provider.create_node(&ctx, node, &kube, action).await })
            })
    }

    pub fn delete(&self, node: Node) -> Action<Node> {
        let engine = self.engine.clone();
        let id = node.id.clone();
        self.engine
            .actions()
            .action(node)
            .description("deleting")
            .max_retries(DELETE_RETRIES)
            .target_id(id)
            .cancel_existing(true)
            .run(move |_, node| {
                Box::pin(async move {
                    // never reached the provider
                    if !node.provider_id.is_empty() {
                        let kube = engine.kubes().get(&node.kube_id).await?;
                        let (provider, ctx) = engine.provider_for(&kube.cloud_account_id).await?;
                        provider.delete_node(&ctx, node).await?;
                    }
                    engine.nodes().collection().delete(node).await
                })
            })
    }
}

pub struct Volumes {
    engine: Engine,
    collection: Collection<Volume>,
}

impl Volumes {
    pub(crate) fn new(engine: Engine) -> Self {
        let collection = Collection::new(engine.store().clone());
        Self { engine, collection }
    }

    pub fn collection(&self) -> &Collection<Volume> {
        &self.collection
    }

    pub async fn create(&self, volume: &mut Volume) -> Result<()> {
        let kube = self.engine.kubes().get(&volume.kube_id).await?;
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;
        self.collection.create(volume).await?;

        self.engine
            .actions()
            .action(volume.clone())
            .description("provisioning")
            .max_retries(PROVISION_RETRIES)
            .run(move |action, volume| {
                Box::pin(async move { provider.create_volume(&ctx, volume, action).await })
            })
            .run_async()
            .await
    }

    pub fn delete(&self, volume: Volume) -> Action<Volume> {
        let engine = self.engine.clone();
        let id = volume.id.clone();
        self.engine
            .actions()
            .action(volume)
            .description("deleting")
            .max_retries(DELETE_RETRIES)
            .target_id(id)
            .cancel_existing(true)
            .run(move |_, volume| {
                Box::pin(async move {
                    let kube = engine.kubes().get(&volume.kube_id).await?;
                    let (provider, ctx) = engine.provider_for(&kube.cloud_account_id).await?;
                    tolerate_unsupported(
                        provider.delete_volume(&ctx, volume).await,
                        &volume.name,
                    )?;
                    engine.volumes().collection().delete(volume).await
                })
            })
    }
}

pub struct Entrypoints {
    engine: Engine,
    collection: Collection<Entrypoint>,
}

impl Entrypoints {
    pub(crate) fn new(engine: Engine) -> Self {
        let collection = Collection::new(engine.store().clone());
        Self { engine, collection }
    }

    pub fn collection(&self) -> &Collection<Entrypoint> {
        &self.collection
    }

    pub async fn get(&self, id: &str) -> Result<Entrypoint> {
        self.collection.get(id).await
    }

    pub async fn create(&self, entrypoint: &mut Entrypoint) -> Result<()> {
        let kube = self.engine.kubes().get(&entrypoint.kube_id).await?;
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;
        self.collection.create(entrypoint).await?;

        self.engine
            .actions()
            .action(entrypoint.clone())
            .description("provisioning")
            .max_retries(PROVISION_RETRIES)
            .run(move |action, entrypoint| {
                Box::pin(async move { provider.create_entrypoint(&ctx, entrypoint, action).await })
            })
            .run_async()
            .await
    }

    pub fn delete(&self, entrypoint: Entrypoint) -> Action<Entrypoint> {
        let engine = self.engine.clone();
        let id = entrypoint.id.clone();
        self.engine
            .actions()
            .action(entrypoint)
            .description("deleting")
            .max_retries(DELETE_RETRIES)
            .target_id(id)
            .cancel_existing(true)
            .run(move |_, entrypoint| {
                Box::pin(async move {
                    let kube = engine.kubes().get(&entrypoint.kube_id).await?;
                    let (provider, ctx) = engine.provider_for(&kube.cloud_account_id).await?;
                    tolerate_unsupported(
                        provider.delete_entrypoint(&ctx, entrypoint).await,
                        &entrypoint.name,
                    )?;
                    engine.entrypoints().collection().delete(entrypoint).await
                })
            })
    }
}

pub struct EntrypointListeners {
    engine: Engine,
    collection: Collection<EntrypointListener>,
}

impl EntrypointListeners {
    pub(crate) fn new(engine: Engine) -> Self {
        let collection = Collection::new(engine.store().clone());
        Self { engine, collection }
    }

    pub fn collection(&self) -> &Collection<EntrypointListener> {
        &self.collection
    }

    /// Persist a listener and configure it on the provider before returning
    pub async fn create(&self, listener: &mut EntrypointListener) -> Result<()> {
        let entrypoint = self.engine.entrypoints().get(&listener.entrypoint_id).await?;
        let kube = self.engine.kubes().get(&entrypoint.kube_id).await?;
        let (provider, ctx) = self.engine.provider_for(&kube.cloud_account_id).await?;
        self.collection.create(listener).await?;

        self.engine
            .actions()
            .action(listener.clone())
            .description("provisioning")
            .max_retries(PROVISION_RETRIES)
            .run(move |_, listener| {
                Box::pin(async move {
                    provider
                        .create_entrypoint_listener(&ctx, listener, &entrypoint)
                        .await
                })
            })
            .now()
            .await?;

        *listener = self.collection.get(&listener.id).await?;
        Ok(())
    }

    pub fn delete(&self, listener: EntrypointListener) -> Action<EntrypointListener> {
        let engine = self.engine.clone();
        let id = listener.id.clone();
        self.engine
            .actions()
            .action(listener)
            .description("deleting")
            .max_retries(DELETE_RETRIES)
            .target_id(id)
            .cancel_existing(true)
            .run(move |_, listener| {
                Box::pin(async move {
                    let entrypoint = engine.entrypoints().get(&listener.entrypoint_id).await?;
                    let kube = engine.kubes().get(&entrypoint.kube_id).await?;
                    let (provider, ctx) = engine.provider_for(&kube.cloud_account_id).await?;
                    tolerate_unsupported(
                        provider
                            .delete_entrypoint_listener(&ctx, listener, &entrypoint)
                            .await,
                        &listener.uuid,
                    )?;
                    engine.entrypoint_listeners().collection().delete(listener).await
                })
            })
    }
}
