//! Settings file model
//!
//! Every section is optional; anything left out keeps its default.
//!
//! ```yaml
//! store:
//!   backend: file
//!   path: /var/lib/kubeforge
//! workers:
//!   count: 4
//!   poll_interval_ms: 1000
//! tasks:
//!   max_attempts: 20
//!   retry_delay_secs: 5
//! observer:
//!   interval_secs: 30
//! digitalocean:
//!   token: dop_v1_...
//!   master_user_data: config/providers/digitalocean/master.yaml
//!   minion_user_data: config/providers/digitalocean/minion.yaml
//! node_sizes:
//!   digitalocean:
//!     - { name: s-1vcpu-2gb, cpu_cores: 1, ram_gib: 2 }
//! ```

use kubeforge_cloud::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, NodeSize, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Project root holding `.kubeforge/store.json`; defaults to the working directory
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub max_attempts: u32,
    /// Minimum wait before a failed task becomes claimable again
    pub retry_delay_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
        }
    }
}

impl TasksConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl ObserverConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanConfig {
    /// API token for the default account
    pub token: Option<String>,
    pub master_user_data: PathBuf,
    pub minion_user_data: PathBuf,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            token: None,
            master_user_data: PathBuf::from("config/providers/digitalocean/master.yaml"),
            minion_user_data: PathBuf::from("config/providers/digitalocean/minion.yaml"),
        }
    }
}

fn size(name: &str, cpu_cores: f64, ram_gib: f64) -> NodeSize {
    NodeSize {
        name: name.to_string(),
        cpu_cores,
        ram_gib,
    }
}

fn default_node_sizes() -> HashMap<ProviderKind, Vec<NodeSize>> {
    HashMap::from([(
        ProviderKind::DigitalOcean,
        vec![
            size("s-1vcpu-1gb", 1.0, 1.0),
            size("s-1vcpu-2gb", 1.0, 2.0),
            size("s-2vcpu-2gb", 2.0, 2.0),
            size("s-2vcpu-4gb", 2.0, 4.0),
            size("s-4vcpu-8gb", 4.0, 8.0),
        ],
    )])
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeforgeConfig {
    pub store: StoreConfig,
    pub workers: WorkersConfig,
    pub tasks: TasksConfig,
    pub observer: ObserverConfig,
    pub digitalocean: DigitalOceanConfig,
    pub node_sizes: HashMap<ProviderKind, Vec<NodeSize>>,
}

impl Default for KubeforgeConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            workers: WorkersConfig::default(),
            tasks: TasksConfig::default(),
            observer: ObserverConfig::default(),
            digitalocean: DigitalOceanConfig::default(),
            node_sizes: default_node_sizes(),
        }
    }
}

impl KubeforgeConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count must be at least 1".into()));
        }
        if self.tasks.max_attempts == 0 {
            return Err(ConfigError::Invalid("tasks.max_attempts must be at least 1".into()));
        }
        if self.observer.enabled && self.observer.interval_secs == 0 {
            return Err(ConfigError::Invalid("observer.interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Project root for the file store
    pub fn store_root(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}
