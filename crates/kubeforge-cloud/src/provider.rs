//! Cloud provider trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::action::ActionHandle;
use crate::engine::Engine;
use crate::error::{CloudError, Result};
use crate::model::{CloudAccount, Entrypoint, EntrypointListener, Kube, Node, Volume};

/// Supported cloud providers
///
/// Only providers with an implementation are listed, so a settings file
/// naming anything else fails to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    DigitalOcean,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::DigitalOcean => "digitalocean",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a provider operation needs besides the resource itself
#[derive(Clone)]
pub struct ProviderContext {
    pub engine: Engine,
    pub account: CloudAccount,
}

/// Cloud provider abstraction trait
///
/// Implementations hold only connection state (e.g. a shared HTTP client);
/// credentials come from the [`CloudAccount`] in the context. Operations
/// that are not available on a provider keep the default `Unsupported`
/// implementation.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Check that the account's credentials work
    async fn validate_account(&self, account: &CloudAccount) -> Result<()>;

    async fn create_kube(
        &self,
        ctx: &ProviderContext,
        kube: &mut Kube,
        action: &ActionHandle,
    ) -> Result<()>;

    async fn delete_kube(&self, ctx: &ProviderContext, kube: &mut Kube) -> Result<()>;

    async fn create_node(
        &self,
        ctx: &ProviderContext,
        node: &mut Node,
        kube: &Kube,
        action: &ActionHandle,
    ) -> Result<()>;

    async fn delete_node(&self, ctx: &ProviderContext, node: &Node) -> Result<()>;

    async fn create_volume(
        &self,
        _ctx: &ProviderContext,
        _volume: &mut Volume,
        _action: &ActionHandle,
    ) -> Result<()> {
        Err(self.unsupported("create_volume"))
    }

    async fn delete_volume(&self, _ctx: &ProviderContext, _volume: &Volume) -> Result<()> {
        Err(self.unsupported("delete_volume"))
    }

    async fn create_entrypoint(
        &self,
        _ctx: &ProviderContext,
        _entrypoint: &mut Entrypoint,
        _action: &ActionHandle,
    ) -> Result<()> {
        Err(self.unsupported("create_entrypoint"))
    }

    async fn delete_entrypoint(
        &self,
        _ctx: &ProviderContext,
        _entrypoint: &Entrypoint,
    ) -> Result<()> {
        Err(self.unsupported("delete_entrypoint"))
    }

    async fn create_entrypoint_listener(
        &self,
        _ctx: &ProviderContext,
        _listener: &mut EntrypointListener,
        _entrypoint: &Entrypoint,
    ) -> Result<()> {
        Err(self.unsupported("create_entrypoint_listener"))
    }

    async fn delete_entrypoint_listener(
        &self,
        _ctx: &ProviderContext,
        _listener: &EntrypointListener,
        _entrypoint: &Entrypoint,
    ) -> Result<()> {
        Err(self.unsupported("delete_entrypoint_listener"))
    }

    fn unsupported(&self, operation: &str) -> CloudError {
        CloudError::Unsupported(format!("{} on {}", operation, self.name()))
    }
}

/// Providers available to the engine, resolved once at startup
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CloudProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| CloudError::ProviderNotFound(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

/// Machine size offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSize {
    pub name: String,
    pub cpu_cores: f64,
    pub ram_gib: f64,
}

impl NodeSize {
    pub fn cpu_millicores(&self) -> i64 {
        (self.cpu_cores * 1000.0) as i64
    }

    pub fn ram_bytes(&self) -> i64 {
        (self.ram_gib * 1_073_741_824.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.get(ProviderKind::DigitalOcean).err().unwrap();
        assert!(matches!(err, CloudError::ProviderNotFound(ref p) if p == "digitalocean"));
    }

    #[test]
    fn test_node_size_limits() {
        let size = NodeSize {
            name: "s-2vcpu-2gb".to_string(),
            cpu_cores: 2.0,
            ram_gib: 2.0,
        };
        assert_eq!(size.cpu_millicores(), 2000);
        assert_eq!(size.ram_bytes(), 2_147_483_648);
    }

    #[test]
    fn test_provider_kind_wire_format() {
        assert_eq!(
            serde_json::to_value(ProviderKind::DigitalOcean).unwrap(),
            serde_json::json!("digitalocean")
        );
        assert!(serde_json::from_value::<ProviderKind>(serde_json::json!("aws")).is_err());
    }
}
