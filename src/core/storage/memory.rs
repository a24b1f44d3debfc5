use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{ObjectStore, RemoteObject};
use crate::core::governor::BandwidthLimiter;

/// Object store kept entirely in memory. Backs simulation mode and tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    fail_deletes: Mutex<bool>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an object directly, bypassing upload.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.lock().insert(key.into(), data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Make every subsequent delete fail, to exercise best-effort paths.
    pub fn set_fail_deletes(&self, fail: bool) {
        *self
            .fail_deletes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bytes>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload_file(
        &self,
        local: &Path,
        key: &str,
        limiter: &BandwidthLimiter,
        counter: Arc<AtomicU64>,
    ) -> Result<u64> {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        let size = data.len() as u64;

        limiter.consume(size).await;
        counter.fetch_add(size, Ordering::Relaxed);
        self.insert(key, data);

        debug!(key, size, "Stored object in memory");
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| RemoteObject {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if *self
            .fail_deletes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(anyhow!("simulated delete failure for {}", key));
        }
        self.lock().remove(key);
        Ok(())
    }
}
