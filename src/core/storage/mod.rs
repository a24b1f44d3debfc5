//! Remote object storage used for uploads, usage reconciliation and pruning.

mod memory;
mod s3_store;

pub use memory::MemoryObjectStore;
pub use s3_store::{S3ObjectStore, S3Settings};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, LazyLock, Mutex};

use crate::core::governor::BandwidthLimiter;
use crate::db::models::StorageProvider;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));

/// Lowercase, dash-separated form of a site name for file and path names.
pub fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let slug = NON_SLUG.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug.to_string()
    }
}

/// Remote prefix holding every backup of one site, with a trailing slash.
///
/// Keyed by the stable node/site UUIDs; falls back to slugged names when either is missing.
pub fn site_prefix(
    root: &str,
    node_uuid: Option<&str>,
    site_uuid: Option<&str>,
    node_name: &str,
    site_name: &str,
) -> String {
    let root = root.trim_matches('/');
    let (node, site) = match (
        node_uuid.filter(|u| !u.is_empty()),
        site_uuid.filter(|u| !u.is_empty()),
    ) {
        (Some(node), Some(site)) => (node.to_string(), site.to_string()),
        _ => (slugify(node_name), slugify(site_name)),
    };

    if root.is_empty() {
        format!("{}/{}/", node, site)
    } else {
        format!("{}/{}/{}/", root, node, site)
    }
}

/// One object returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file, pacing chunks through `limiter` and adding sent bytes to `counter`.
    async fn upload_file(
        &self,
        local: &Path,
        key: &str,
        limiter: &BandwidthLimiter,
        counter: Arc<AtomicU64>,
    ) -> Result<u64>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Turns a storage provider record into a live object store client.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, provider: &StorageProvider) -> Result<Arc<dyn ObjectStore>>;
}

/// Builds an S3 client per provider.
pub struct S3Resolver {
    chunk_size: usize,
}

impl S3Resolver {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl DestinationResolver for S3Resolver {
    fn resolve(&self, provider: &StorageProvider) -> Result<Arc<dyn ObjectStore>> {
        let settings = S3Settings::from_provider(provider)?;
        Ok(Arc::new(S3ObjectStore::new(&settings, self.chunk_size)?))
    }
}

/// Hands out one in-memory store per provider, shared across calls.
#[derive(Default)]
pub struct SimulatedResolver {
    stores: Mutex<HashMap<i64, Arc<MemoryObjectStore>>>,
}

impl SimulatedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store backing `provider_id`, created empty on first access.
    pub fn store(&self, provider_id: i64) -> Arc<MemoryObjectStore> {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stores
            .entry(provider_id)
            .or_insert_with(|| Arc::new(MemoryObjectStore::new()))
            .clone()
    }
}

impl DestinationResolver for SimulatedResolver {
    fn resolve(&self, provider: &StorageProvider) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.store(provider.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Blog.example.com"), "my-blog-example-com");
        assert_eq!(slugify("  --Café Säge!! "), "caf-s-ge");
        assert_eq!(slugify("???"), "site");
    }

    #[test]
    fn test_site_prefix_prefers_uuids() {
        assert_eq!(
            site_prefix("backups", Some("n-1"), Some("s-1"), "Node A", "Blog"),
            "backups/n-1/s-1/"
        );
        assert_eq!(
            site_prefix("/backups/", None, Some("s-1"), "Node A", "My Blog"),
            "backups/node-a/my-blog/"
        );
        assert_eq!(site_prefix("", Some(""), Some("s-1"), "n", "s"), "n/s/");
    }

    #[tokio::test]
    async fn test_simulated_resolver_shares_store_per_provider() {
        let resolver = SimulatedResolver::new();
        resolver.store(1).insert("a", vec![1u8]);

        let provider = StorageProvider {
            id: 1,
            name: "sim".to_string(),
            bucket: "b".to_string(),
            region: String::new(),
            endpoint: None,
            access_key: String::new(),
            secret_key: String::new(),
            used_bytes: 0,
        };
        let store = resolver.resolve(&provider).unwrap();
        assert_eq!(store.list("").await.unwrap().len(), 1);
    }
}
