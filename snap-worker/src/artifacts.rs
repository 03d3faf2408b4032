use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object write failed: {0}")]
    Write(String),
    #[error("object delete failed: {0}")]
    Delete(String),
}

/// Where finished artifacts go. `put` returns the URL the job row records as
/// `result_url`; serving (and token-gating) that URL is the API layer's
/// concern.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Filesystem-backed store for single-node deployments: artifacts land under
/// a root directory and are addressed by a public base URL.
pub struct LocalDiskStore {
    root: PathBuf,
    public_base: String,
}

impl LocalDiskStore {
    pub fn new(root: impl AsRef<Path>, public_base: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalDiskStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| ObjectStoreError::Write(error.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|error| ObjectStoreError::Write(error.to_string()))?;
        Ok(format!("{}/{}", self.public_base, key))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        tokio::fs::remove_file(self.root.join(key))
            .await
            .map_err(|error| ObjectStoreError::Delete(error.to_string()))
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(format!("memory://{key}"))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
