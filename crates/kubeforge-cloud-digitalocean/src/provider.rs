//! DigitalOcean provider implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kubeforge_cloud::{
    ActionHandle, CloudAccount, CloudError, CloudProvider, Kube, Node, Procedure,
    ProviderContext, ProviderKind,
};

use crate::api::{CreateDropletRequest, Droplet, DropletApi, DropletConnector, HttpDropletConnector};
use crate::error::{DigitalOceanError, Result};

const COREOS_IMAGE: &str = "coreos-stable";
const CLUSTER_TAG: &str = "Kubernetes-Cluster";
const KUBERNETES_WAIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const KUBERNETES_WAIT_INTERVAL: Duration = Duration::from_secs(3);
const ADDRESS_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ADDRESS_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Cloud-config documents passed to new droplets
#[derive(Debug, Clone, Default)]
pub struct UserData {
    pub master: String,
    pub minion: String,
}

impl UserData {
    /// Read both documents from disk
    pub async fn load(master: impl AsRef<Path>, minion: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            master: tokio::fs::read_to_string(master).await?,
            minion: tokio::fs::read_to_string(minion).await?,
        })
    }
}

/// DigitalOcean provider
pub struct DigitalOceanProvider {
    connector: Arc<dyn DropletConnector>,
    user_data: UserData,
    wait_timeout: Duration,
    wait_interval: Duration,
    address_timeout: Duration,
    address_interval: Duration,
}

impl DigitalOceanProvider {
    pub fn new(client: reqwest::Client, user_data: UserData) -> Self {
        Self::with_connector(Arc::new(HttpDropletConnector::new(client)), user_data)
    }

    pub fn with_connector(connector: Arc<dyn DropletConnector>, user_data: UserData) -> Self {
        Self {
            connector,
            user_data,
            wait_timeout: KUBERNETES_WAIT_TIMEOUT,
            wait_interval: KUBERNETES_WAIT_INTERVAL,
            address_timeout: ADDRESS_WAIT_TIMEOUT,
            address_interval: ADDRESS_WAIT_INTERVAL,
        }
    }

    /// Override how long provisioning waits for the Kubernetes API
    pub fn with_kubernetes_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.wait_timeout = timeout;
        self.wait_interval = interval;
        self
    }

    /// Override how long provisioning waits for a new droplet's public address
    pub fn with_address_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.address_timeout = timeout;
        self.address_interval = interval;
        self
    }

    fn api(&self, account: &CloudAccount) -> Arc<dyn DropletApi> {
        self.connector.connect(&account.token)
    }
}

fn global_tags(kube_name: &str) -> Vec<String> {
    vec![
        CLUSTER_TAG.to_string(),
        kube_name.to_string(),
        format!("{}-master", kube_name),
        format!("{}-minion", kube_name),
    ]
}

fn ssh_keys(fingerprint: &str) -> Vec<String> {
    if fingerprint.is_empty() {
        Vec::new()
    } else {
        vec![fingerprint.to_string()]
    }
}

/// Create a droplet and attach `tags` to it
async fn create_droplet(
    api: &dyn DropletApi,
    request: &CreateDropletRequest,
    tags: &[String],
) -> Result<Droplet> {
    let droplet = api.create_droplet(request).await?;

    for tag in tags {
        if let Err(e) = api.tag_droplet(tag, droplet.id).await {
            tracing::warn!("Failed to tag droplet {} with {}: {}", droplet.id, tag, e);
        }
    }
    Ok(droplet)
}

/// Poll the droplet until it reports a public address, then return it reloaded.
///
/// The create response never carries the address.
async fn wait_for_public_ip(
    api: Arc<dyn DropletApi>,
    action: &ActionHandle,
    id: u64,
    timeout: Duration,
    interval: Duration,
) -> kubeforge_cloud::Result<(Droplet, String)> {
    action
        .cancellable_wait_for(
            &format!("public address of droplet {}", id),
            timeout,
            interval,
            || {
                let api = api.clone();
                async move {
                    let droplet = api.get_droplet(id).await?;
                    Ok::<bool, CloudError>(droplet.public_ipv4().is_some())
                }
            },
        )
        .await?;

    let droplet = api.get_droplet(id).await?;
    let public_ip = droplet
        .public_ipv4()
        .ok_or(DigitalOceanError::NoPublicIp(id))?
        .to_string();
    Ok((droplet, public_ip))
}

fn creation_timestamp(droplet: &Droplet) -> Option<DateTime<Utc>> {
    if droplet.created_at.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(&droplet.created_at) {
        Ok(created) => Some(created.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(
                "Could not parse droplet creation timestamp '{}': {}",
                droplet.created_at,
                e
            );
            None
        }
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn validate_account(&self, account: &CloudAccount) -> kubeforge_cloud::Result<()> {
        self.api(account).list_droplets().await?;
        Ok(())
    }

    async fn create_kube(
        &self,
        ctx: &ProviderContext,
        kube: &mut Kube,
        action: &ActionHandle,
    ) -> kubeforge_cloud::Result<()> {
        let api = self.api(&ctx.account);
        let mut procedure = Procedure::new("Create Kube", ctx.engine.store().clone());

        let tag_api = api.clone();
        procedure.add_step("creating global tags for Kube", move |kube: &mut Kube| {
            Box::pin(async move {
                // Created once, then attached by name to each droplet
                for tag in global_tags(&kube.name) {
                    if let Err(e) = tag_api.create_tag(&tag).await {
                        tracing::warn!("Failed to create DigitalOcean tag '{}': {}", tag, e);
                    }
                }
                Ok(())
            })
        });

        let master_api = api.clone();
        let master_user_data = self.user_data.master.clone();
        procedure.add_step("creating master", move |kube: &mut Kube| {
            Box::pin(async move {
                // The id is checkpointed before the address is known
                if kube.master_id != 0 {
                    return Ok(());
                }
                let request = CreateDropletRequest {
                    name: format!("{}-master", kube.name),
                    region: kube.region.clone(),
                    size: kube.master_node_size.clone(),
                    image: COREOS_IMAGE.to_string(),
                    ssh_keys: ssh_keys(&kube.ssh_key_fingerprint),
                    private_networking: false,
                    user_data: master_user_data,
                };
                let tags = vec![
                    CLUSTER_TAG.to_string(),
                    kube.name.clone(),
                    request.name.clone(),
                ];
                let droplet = create_droplet(master_api.as_ref(), &request, &tags).await?;
                kube.master_id = droplet.id;
                Ok(())
            })
        });

        let address_api = api.clone();
        let address_action = action.clone();
        let (address_timeout, address_interval) = (self.address_timeout, self.address_interval);
        procedure.add_step("waiting for master address", move |kube: &mut Kube| {
            Box::pin(async move {
                if !kube.master_public_ip.is_empty() {
                    return Ok(());
                }
                let (_, public_ip) = wait_for_public_ip(
                    address_api,
                    &address_action,
                    kube.master_id,
                    address_timeout,
                    address_interval,
                )
                .await?;
                kube.master_public_ip = public_ip;
                Ok(())
            })
        });

        let engine = ctx.engine.clone();
        procedure.add_step("building Kubernetes minion", move |kube: &mut Kube| {
            Box::pin(async move {
                let nodes = engine.nodes();
                if !nodes
                    .collection()
                    .find(|n| n.kube_id == kube.id)
                    .await?
                    .is_empty()
                {
                    return Ok(());
                }
                let size = kube
                    .node_sizes
                    .first()
                    .ok_or(DigitalOceanError::NoNodeSizes)?;
                let mut node = Node::new(kube.id.clone(), size.clone());
                nodes.create(&mut node).await
            })
        });

        let engine = ctx.engine.clone();
        let action = action.clone();
        let (timeout, interval) = (self.wait_timeout, self.wait_interval);
        procedure.add_step("waiting for Kubernetes", move |kube: &mut Kube| {
            Box::pin(async move {
                let k8s = engine.kubernetes(kube);
                action
                    .cancellable_wait_for(
                        "Kubernetes API and first minion",
                        timeout,
                        interval,
                        || {
                            let k8s = k8s.clone();
                            async move {
                                let nodes = k8s.list_nodes().await?;
                                Ok::<bool, CloudError>(!nodes.is_empty())
                            }
                        },
                    )
                    .await
            })
        });

        procedure.run(kube).await
    }

    async fn delete_kube(
        &self,
        ctx: &ProviderContext,
        kube: &mut Kube,
    ) -> kubeforge_cloud::Result<()> {
        let api = self.api(&ctx.account);
        let mut procedure = Procedure::new("Delete Kube", ctx.engine.store().clone());

        procedure.add_step("deleting master", move |kube: &mut Kube| {
            Box::pin(async move {
                if kube.master_id == 0 {
                    return Ok(());
                }
                match api.delete_droplet(kube.master_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!("Master droplet {} already gone", kube.master_id);
                    }
                    Err(e) => return Err(e.into()),
                }
                kube.master_id = 0;
                Ok(())
            })
        });

        procedure.run(kube).await
    }

    async fn create_node(
        &self,
        ctx: &ProviderContext,
        node: &mut Node,
        kube: &Kube,
        action: &ActionHandle,
    ) -> kubeforge_cloud::Result<()> {
        let api = self.api(&ctx.account);
        let nodes = ctx.engine.nodes();

        if node.provider_id.is_empty() {
            let request = CreateDropletRequest {
                name: node.name.clone(),
                region: kube.region.clone(),
                size: node.size.clone(),
                image: COREOS_IMAGE.to_string(),
                ssh_keys: ssh_keys(&kube.ssh_key_fingerprint),
                private_networking: true,
                user_data: self.user_data.minion.clone(),
            };
            let tags = vec![
                CLUSTER_TAG.to_string(),
                kube.name.clone(),
                format!("{}-minion", kube.name),
            ];
            let droplet = create_droplet(api.as_ref(), &request, &tags).await?;
            node.provider_id = droplet.id.to_string();
            node.provider_creation_timestamp = creation_timestamp(&droplet);

            // Record the droplet before anything else can fail
            nodes.collection().save(node).await?;
        }

        if node.external_ip.is_empty() {
            let id: u64 = node
                .provider_id
                .parse()
                .map_err(|_| DigitalOceanError::InvalidDropletId(node.provider_id.clone()))?;
            let (droplet, public_ip) = wait_for_public_ip(
                api,
                action,
                id,
                self.address_timeout,
                self.address_interval,
            )
            .await?;
            if node.provider_creation_timestamp.is_none() {
                node.provider_creation_timestamp = creation_timestamp(&droplet);
            }
            node.external_ip = public_ip;
            nodes.collection().save(node).await?;
        }
        Ok(())
    }

    async fn delete_node(&self, ctx: &ProviderContext, node: &Node) -> kubeforge_cloud::Result<()> {
        let id: u64 = node
            .provider_id
            .parse()
            .map_err(|_| DigitalOceanError::InvalidDropletId(node.provider_id.clone()))?;

        match self.api(&ctx.account).delete_droplet(id).await {
            Err(e) if e.is_not_found() => {
                tracing::debug!("Droplet {} already gone", id);
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
