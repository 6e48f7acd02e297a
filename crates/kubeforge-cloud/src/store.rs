//! Durable entity store
//!
//! The store is the single source of truth for tasks and provisioned
//! resources. Keys are `/`-separated paths; `create_in_order` allocates
//! zero-padded sequence keys so that lexical order equals insertion order.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`] for tests and single-process use
//! - [`FileStore`], which persists to `.kubeforge/store.json` (with a backup
//!   of the previous revision) and is safe to share between processes

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STORE_VERSION: u32 = 1;
const STORE_DIR: &str = ".kubeforge";
const STORE_FILE: &str = "store.json";
const STORE_BACKUP: &str = "store.json.backup";
const STORE_TEMP: &str = "store.json.tmp";
const LOCK_FILE: &str = "store.lock";

/// Key-value store consumed by the orchestration core
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert `value` under a freshly allocated key at the tail of `namespace`
    async fn create_in_order(&self, namespace: &str, value: Value) -> Result<String>;

    /// All records under `namespace`, in insertion order
    async fn list_in_order(&self, namespace: &str) -> Result<Vec<(String, Value)>>;

    async fn get(&self, key: &str) -> Result<Value>;

    /// Insert under an explicit key; fails with `AlreadyExists`
    async fn create(&self, key: &str, value: Value) -> Result<()>;

    /// Overwrite an existing record; fails with `NotFound`
    async fn update(&self, key: &str, value: Value) -> Result<()>;

    /// Replace the record only if it still equals `expected`.
    ///
    /// Fails with `Conflict` when the stored value differs and with
    /// `NotFound` when the key is gone.
    async fn compare_and_swap(&self, key: &str, expected: &Value, next: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the key for sequence number `seq` inside `namespace`
pub fn ordered_key(namespace: &str, seq: u64) -> String {
    format!("{}/{:020}", namespace.trim_end_matches('/'), seq)
}

/// Last path segment of a key, used as the record id
pub fn key_id(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Serialized contents of a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    /// Store file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Next sequence number handed out by `create_in_order`
    pub next_seq: u64,

    /// Records indexed by key
    pub records: BTreeMap<String, Value>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            next_seq: 1,
            records: BTreeMap::new(),
        }
    }
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn create_in_order(&mut self, namespace: &str, value: Value) -> String {
        let key = ordered_key(namespace, self.next_seq);
        self.next_seq += 1;
        self.records.insert(key.clone(), value);
        self.touch();
        key
    }

    pub fn list_in_order(&self, namespace: &str) -> Vec<(String, Value)> {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        self.records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.records
            .get(key)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(key.to_string()))
    }

    pub fn create(&mut self, key: &str, value: Value) -> Result<()> {
        if self.records.contains_key(key) {
            return Err(CloudError::AlreadyExists(key.to_string()));
        }
        self.records.insert(key.to_string(), value);
        self.touch();
        Ok(())
    }

    pub fn update(&mut self, key: &str, value: Value) -> Result<()> {
        let slot = self
            .records
            .get_mut(key)
            .ok_or_else(|| CloudError::NotFound(key.to_string()))?;
        *slot = value;
        self.touch();
        Ok(())
    }

    pub fn compare_and_swap(&mut self, key: &str, expected: &Value, next: Value) -> Result<()> {
        let slot = self
            .records
            .get_mut(key)
            .ok_or_else(|| CloudError::NotFound(key.to_string()))?;
        if slot != expected {
            return Err(CloudError::Conflict(format!(
                "{} was modified concurrently",
                key
            )));
        }
        *slot = next;
        self.touch();
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.records
            .remove(key)
            .ok_or_else(|| CloudError::NotFound(key.to_string()))?;
        self.touch();
        Ok(())
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_in_order(&self, namespace: &str, value: Value) -> Result<String> {
        Ok(self.state.lock().await.create_in_order(namespace, value))
    }

    async fn list_in_order(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        Ok(self.state.lock().await.list_in_order(namespace))
    }

    async fn get(&self, key: &str) -> Result<Value> {
        self.state.lock().await.get(key)
    }

    async fn create(&self, key: &str, value: Value) -> Result<()> {
        self.state.lock().await.create(key, value)
    }

    async fn update(&self, key: &str, value: Value) -> Result<()> {
        self.state.lock().await.update(key, value)
    }

    async fn compare_and_swap(&self, key: &str, expected: &Value, next: Value) -> Result<()> {
        self.state.lock().await.compare_and_swap(key, expected, next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().await.delete(key)
    }
}

/// Store persisted as a JSON document under the project root
///
/// Every operation holds an exclusive `flock` on `.kubeforge/store.lock`, so
/// a daemon and CLI invocations can share one store file. Saves go through a
/// temp file renamed over `store.json`; readers never see a partial document.
pub struct FileStore {
    /// Project root directory
    project_root: PathBuf,
    lock: Mutex<()>,
}

/// Exclusive hold on the store lock file, released on drop
struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release store lock: {}", e);
        }
    }
}

impl FileStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn store_dir(&self) -> PathBuf {
        self.project_root.join(STORE_DIR)
    }

    fn store_path(&self) -> PathBuf {
        self.store_dir().join(STORE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.store_dir().join(STORE_BACKUP)
    }

    fn temp_path(&self) -> PathBuf {
        self.store_dir().join(STORE_TEMP)
    }

    fn lock_path(&self) -> PathBuf {
        self.store_dir().join(LOCK_FILE)
    }

    async fn ensure_store_dir(&self) -> Result<()> {
        let dir = self.store_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created store directory: {}", dir.display());
        }
        Ok(())
    }

    /// Block until this process holds the store lock
    async fn acquire_lock(&self) -> Result<StoreLock> {
        self.ensure_store_dir().await?;
        let path = self.lock_path();

        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| CloudError::StateError(format!("store lock task failed: {}", e)))??;

        Ok(StoreLock { file })
    }

    async fn read_state(path: &Path) -> Result<Option<StoreState>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).await?;
        let state: StoreState = serde_json::from_str(&content)?;

        if state.version > STORE_VERSION {
            return Err(CloudError::StateError(format!(
                "Store file version {} is newer than supported version {}",
                state.version, STORE_VERSION
            )));
        }
        Ok(Some(state))
    }

    /// Load the current state, falling back to the backup if `store.json`
    /// is missing or unreadable
    pub async fn load(&self) -> Result<StoreState> {
        let backup = self.backup_path();
        match Self::read_state(&self.store_path()).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => match Self::read_state(&backup).await? {
                Some(state) => {
                    tracing::warn!("Store file missing, restored from {}", backup.display());
                    Ok(state)
                }
                None => {
                    tracing::debug!("Store file not found, returning empty state");
                    Ok(StoreState::new())
                }
            },
            Err(CloudError::Json(e)) => {
                tracing::warn!("Store file is corrupt ({}), trying {}", e, backup.display());
                Self::read_state(&backup).await?.ok_or(CloudError::Json(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Save the state, keeping the previous revision as a backup
    pub async fn save(&self, state: &StoreState) -> Result<()> {
        self.ensure_store_dir().await?;

        let path = self.store_path();
        let temp = self.temp_path();

        let content = serde_json::to_string_pretty(state)?;
        let mut file = fs::File::create(&temp).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!("Saved store with {} records", state.records.len());
        Ok(())
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let _lock = self.acquire_lock().await?;
        f(&self.load().await?)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let _lock = self.acquire_lock().await?;
        let mut state = self.load().await?;
        let out = f(&mut state)?;
        self.save(&state).await?;
        Ok(out)
    }
}

#[async_trait]
impl EntityStore for FileStore {
    async fn create_in_order(&self, namespace: &str, value: Value) -> Result<String> {
        self.mutate(|s| Ok(s.create_in_order(namespace, value)))
            .await
    }

    async fn list_in_order(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        self.read(|s| Ok(s.list_in_order(namespace))).await
    }

    async fn get(&self, key: &str) -> Result<Value> {
        self.read(|s| s.get(key)).await
    }

    async fn create(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|s| s.create(key, value)).await
    }

    async fn update(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|s| s.update(key, value)).await
    }

    async fn compare_and_swap(&self, key: &str, expected: &Value, next: Value) -> Result<()> {
        self.mutate(|s| s.compare_and_swap(key, expected, next))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.mutate(|s| s.delete(key)).await
    }
}
