use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use agproxy_common::CredentialKind;

use crate::record::{CredentialRecord, CredentialState, StatePatch};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Minimal key/value persistence contract. Two namespaces per credential
/// kind (record blob, runtime-state blob) plus a free-form config
/// namespace. Updates are atomic per key.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_credential(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<Option<CredentialRecord>, StorageError>;

    async fn store_credential(
        &self,
        kind: CredentialKind,
        name: &str,
        record: &CredentialRecord,
    ) -> Result<(), StorageError>;

    async fn list_credentials(&self, kind: CredentialKind) -> Result<Vec<String>, StorageError>;

    async fn get_state(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<CredentialState, StorageError>;

    /// Read-modify-write under the store's per-key lock.
    async fn update_state(
        &self,
        kind: CredentialKind,
        name: &str,
        patch: StatePatch,
    ) -> Result<CredentialState, StorageError>;

    async fn get_config(&self, key: &str) -> Result<Option<JsonValue>, StorageError>;

    async fn set_config(&self, key: &str, value: JsonValue) -> Result<(), StorageError>;
}

/// JSON files under a credentials directory:
/// `<root>/<kind>/credentials/<name>.json`,
/// `<root>/<kind>/credential_state/<name>.json`,
/// `<root>/config/<key>.json`.
///
/// Atomicity is write-temp-then-rename; a single write lock serializes
/// read-modify-write cycles.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn credential_path(&self, kind: CredentialKind, name: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join("credentials")
            .join(format!("{name}.json"))
    }

    fn state_path(&self, kind: CredentialKind, name: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join("credential_state")
            .join(format!("{name}.json"))
    }

    fn config_path(&self, key: &str) -> PathBuf {
        self.root.join("config").join(format!("{key}.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn get_credential(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        self.read_json(&self.credential_path(kind, name)).await
    }

    async fn store_credential(
        &self,
        kind: CredentialKind,
        name: &str,
        record: &CredentialRecord,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&self.credential_path(kind, name), bytes)
            .await
    }

    async fn list_credentials(&self, kind: CredentialKind) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(kind.as_str()).join("credentials");
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_state(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<CredentialState, StorageError> {
        Ok(self
            .read_json(&self.state_path(kind, name))
            .await?
            .unwrap_or_default())
    }

    async fn update_state(
        &self,
        kind: CredentialKind,
        name: &str,
        patch: StatePatch,
    ) -> Result<CredentialState, StorageError> {
        let _guard = self.write_lock.lock().await;
        let path = self.state_path(kind, name);
        let mut state: CredentialState = self.read_json(&path).await?.unwrap_or_default();
        patch.apply(&mut state);
        let bytes = serde_json::to_vec_pretty(&state)?;
        self.write_atomic(&path, bytes).await?;
        Ok(state)
    }

    async fn get_config(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        self.read_json(&self.config_path(key)).await
    }

    async fn set_config(&self, key: &str, value: JsonValue) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&value)?;
        self.write_atomic(&self.config_path(key), bytes).await
    }
}

type CredKey = (CredentialKind, String);

/// In-memory store for tests and the persistence-unavailable mirror.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    credentials: HashMap<CredKey, CredentialRecord>,
    states: HashMap<CredKey, CredentialState>,
    config: HashMap<String, JsonValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_credential(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<Option<CredentialRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.credentials.get(&(kind, name.to_string())).cloned())
    }

    async fn store_credential(
        &self,
        kind: CredentialKind,
        name: &str,
        record: &CredentialRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .credentials
            .insert((kind, name.to_string()), record.clone());
        Ok(())
    }

    async fn list_credentials(&self, kind: CredentialKind) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner
            .credentials
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_state(
        &self,
        kind: CredentialKind,
        name: &str,
    ) -> Result<CredentialState, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .states
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_state(
        &self,
        kind: CredentialKind,
        name: &str,
        patch: StatePatch,
    ) -> Result<CredentialState, StorageError> {
        let mut inner = self.inner.lock().await;
        let state = inner.states.entry((kind, name.to_string())).or_default();
        patch.apply(state);
        Ok(state.clone())
    }

    async fn get_config(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: JsonValue) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.config.insert(key.to_string(), value);
        Ok(())
    }
}
