//! Best-effort key/value persistence for running totals (spec §4.F).
//!
//! `FileStore` reuses the temp-file-then-rename trick this codebase already
//! relies on elsewhere for crash-safe writes; `InMemoryStore` backs tests and
//! hosts that don't want a filesystem dependency.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
}

#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) {
        self.data.lock().await.insert(key.to_string(), value);
    }
}

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SyncStore for FileStore {
    async fn get(&self, key: &str) -> Option<String> {
        tokio::fs::read_to_string(self.path_for(key)).await.ok()
    }

    async fn set(&self, key: &str, value: String) {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %err, "failed to create store directory");
                return;
            }
        }

        // Atomic-ish write: temp file then rename, so a crash mid-write never
        // leaves a half-written totals file behind.
        let tmp_path = path.with_extension("json.tmp");
        if let Err(err) = tokio::fs::write(&tmp_path, &value).await {
            tracing::warn!(error = %err, "failed to write temp store file");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            tracing::warn!(error = %err, "failed to replace store file");
        }
    }
}
