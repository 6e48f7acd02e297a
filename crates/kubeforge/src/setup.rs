//! Engine wiring from configuration

use anyhow::Context;
use kubeforge_cloud::{
    CloudAccount, Engine, EntityStore, FileStore, MemoryStore, ProviderKind,
};
use kubeforge_cloud_digitalocean::{DigitalOceanProvider, UserData};
use kubeforge_config::{KubeforgeConfig, StoreBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ACCOUNT: &str = "digitalocean";

pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(KubeforgeConfig, Option<PathBuf>)> {
    match explicit {
        Some(path) => {
            let config = KubeforgeConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        }
        None => Ok(kubeforge_config::load_config()?),
    }
}

fn open_store(config: &KubeforgeConfig) -> anyhow::Result<Arc<dyn EntityStore>> {
    Ok(match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; nothing will persist across restarts");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::File => {
            let root = config.store_root()?;
            tracing::debug!("Using file store under {}", root.display());
            Arc::new(FileStore::new(root))
        }
    })
}

pub async fn build_engine(config: &KubeforgeConfig) -> anyhow::Result<Engine> {
    let store = open_store(config)?;

    let user_data = match UserData::load(
        &config.digitalocean.master_user_data,
        &config.digitalocean.minion_user_data,
    )
    .await
    {
        Ok(user_data) => user_data,
        Err(e) => {
            tracing::warn!("DigitalOcean user-data not loaded ({}); droplets boot without it", e);
            UserData::default()
        }
    };

    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let mut builder = Engine::builder(store)
        .provider(Arc::new(DigitalOceanProvider::new(client, user_data)))
        .max_attempts(config.tasks.max_attempts)
        .retry_delay(config.tasks.retry_delay());
    for (kind, sizes) in &config.node_sizes {
        builder = builder.node_sizes(*kind, sizes.clone());
    }

    Ok(builder.build()?)
}

/// Register the configured DigitalOcean token as an account, once
pub async fn ensure_default_account(engine: &Engine, config: &KubeforgeConfig) -> anyhow::Result<()> {
    let Some(token) = &config.digitalocean.token else {
        return Ok(());
    };

    let accounts = engine.cloud_accounts();
    if !accounts
        .find(|a| a.provider == ProviderKind::DigitalOcean && a.name == DEFAULT_ACCOUNT)
        .await?
        .is_empty()
    {
        return Ok(());
    }

    let mut account = CloudAccount::new(DEFAULT_ACCOUNT, ProviderKind::DigitalOcean, token.clone());
    engine
        .providers()
        .get(account.provider)?
        .validate_account(&account)
        .await
        .context("DigitalOcean token was rejected")?;
    accounts.create(&mut account).await?;
    tracing::info!("Registered cloud account {} ({})", account.name, account.id);
    Ok(())
}
