//! S3-compatible object store on `rust-s3`.
//!
//! Custom endpoints (MinIO, Wasabi, B2) switch the bucket to path-style
//! addressing.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{ObjectStore, RemoteObject};
use crate::core::governor::BandwidthLimiter;
use crate::db::models::StorageProvider;
use crate::logging::LogThrottle;

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Settings {
    /// Validate a provider record. Missing bucket or credentials is a configuration error.
    pub fn from_provider(provider: &StorageProvider) -> Result<Self> {
        if provider.bucket.trim().is_empty() {
            bail!("Storage provider {} has no bucket configured", provider.id);
        }
        if provider.access_key.is_empty() || provider.secret_key.is_empty() {
            bail!("Storage provider {} is missing credentials", provider.id);
        }

        Ok(Self {
            bucket: provider.bucket.clone(),
            region: if provider.region.is_empty() {
                "us-east-1".to_string()
            } else {
                provider.region.clone()
            },
            endpoint: provider.endpoint.clone().filter(|e| !e.is_empty()),
            access_key: provider.access_key.clone(),
            secret_key: provider.secret_key.clone(),
        })
    }
}

pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    chunk_size: usize,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings, chunk_size: usize) -> Result<Self> {
        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| anyhow!("Invalid S3 credentials: {}", e))?;

        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings
                .region
                .parse()
                .map_err(|_| anyhow!("Invalid S3 region: {}", settings.region))?,
        };

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| anyhow!("Failed to create S3 bucket handle: {}", e))?;

        let bucket = if settings.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            chunk_size: chunk_size.max(64 * 1024),
        })
    }
}

/// Reader state for one throttled upload.
struct Upload {
    file: Option<tokio::fs::File>,
    limiter: BandwidthLimiter,
    counter: Arc<AtomicU64>,
    chunk_size: usize,
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_file(
        &self,
        local: &Path,
        key: &str,
        limiter: &BandwidthLimiter,
        counter: Arc<AtomicU64>,
    ) -> Result<u64> {
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        let total = file.metadata().await?.len();
        let start = counter.load(Ordering::Relaxed);

        let throttle = Arc::new(LogThrottle::new(Duration::from_secs(5)));
        let upload = Upload {
            file: Some(file),
            limiter: limiter.clone(),
            counter: counter.clone(),
            chunk_size: self.chunk_size,
        };

        // Each chunk waits on the bandwidth window before it is handed to the client.
        let chunks = stream::unfold(upload, move |mut state| {
            let throttle = throttle.clone();
            async move {
                let mut file = state.file.take()?;
                let mut buf = vec![0u8; state.chunk_size];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        state.limiter.consume(n as u64).await;
                        let sent = state.counter.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
                        if throttle.should_log() {
                            debug!(bytes = sent, total, "Upload progress");
                        }
                        state.file = Some(file);
                        Some((Ok::<Bytes, std::io::Error>(Bytes::from(buf)), state))
                    }
                    Err(e) => Some((Err(e), state)),
                }
            }
        });

        let mut reader = StreamReader::new(Box::pin(chunks));
        self.bucket
            .put_object_stream(&mut reader, key)
            .await
            .map_err(|e| anyhow!("Failed to upload '{}': {}", key, e))?;

        let sent = counter.load(Ordering::Relaxed).saturating_sub(start);
        info!(key, bytes = sent, "Upload complete");
        Ok(sent)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| anyhow!("Failed to list objects under '{}': {}", prefix, e))?;

        let objects: Vec<RemoteObject> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|obj| RemoteObject {
                key: obj.key,
                size: obj.size,
            })
            .collect();

        debug!(prefix, count = objects.len(), "Listed remote objects");
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bucket
            .delete_object(key)
            .await
            .map_err(|e| anyhow!("Failed to delete object '{}': {}", key, e))?;

        debug!(key, "Deleted remote object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StorageProvider {
        StorageProvider {
            id: 3,
            name: "minio".to_string(),
            bucket: "site-backups".to_string(),
            region: String::new(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            access_key: "minio".to_string(),
            secret_key: "minio123".to_string(),
            used_bytes: 0,
        }
    }

    #[test]
    fn test_settings_default_region() {
        let settings = S3Settings::from_provider(&provider()).unwrap();
        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.endpoint.as_deref(), Some("http://127.0.0.1:9000"));
    }

    #[test]
    fn test_settings_require_credentials() {
        let mut p = provider();
        p.secret_key.clear();
        assert!(S3Settings::from_provider(&p).is_err());

        let mut p = provider();
        p.bucket = " ".to_string();
        assert!(S3Settings::from_provider(&p).is_err());
    }

    #[test]
    fn test_custom_endpoint_builds_client() {
        let settings = S3Settings::from_provider(&provider()).unwrap();
        assert!(S3ObjectStore::new(&settings, 1024 * 1024).is_ok());
    }
}
