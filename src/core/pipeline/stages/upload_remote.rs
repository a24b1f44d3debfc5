use serde_json::json;
use tracing::info;

use super::data;
use crate::core::models::StageResult;
use crate::core::pipeline::{BackupContext, SiteBackupModule, keys};
use crate::core::storage::site_prefix;

pub async fn run(module: &SiteBackupModule, ctx: &mut BackupContext) -> StageResult {
    let Some(destination) = ctx.destination.clone() else {
        return StageResult::skipped("No storage destination configured");
    };
    let Some(archive) = ctx.archive_path.clone() else {
        return StageResult::failed("No archive to upload");
    };
    let Some(file_name) = archive.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return StageResult::failed(format!("Invalid archive path {}", archive.display()));
    };

    let prefix = site_prefix(
        &module.storage.remote_prefix,
        ctx.config_value(keys::NODE_UUID),
        ctx.config_value(keys::SITE_UUID),
        ctx.config_value(keys::NODE_NAME).unwrap_or("node"),
        ctx.config_value(keys::SITE_NAME).unwrap_or(&ctx.target_name),
    );
    let key = format!("{}{}", prefix, file_name);

    let _permit = module.governor.acquire_network().await;

    let sent = match destination
        .store
        .upload_file(
            &archive,
            &key,
            module.governor.bandwidth(),
            ctx.byte_counter(),
        )
        .await
    {
        Ok(sent) => sent,
        Err(e) => return StageResult::failed(format!("Upload failed: {:#}", e)),
    };

    info!(
        job_id = %ctx.job_id,
        provider_id = destination.provider_id,
        key = %key,
        bytes = sent,
        "Archive uploaded"
    );

    ctx.remote_path = Some(key.clone());
    ctx.set_data(data::UPLOADED_BYTES, sent);

    StageResult::completed(format!("Uploaded {} bytes to {}", sent, key)).with_details(json!({
        "remote_path": key,
        "bytes": sent,
        "provider_id": destination.provider_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::core::models::StageStatus;
    use crate::core::pipeline::Destination;
    use crate::core::pipeline::stages::test_support::{context, module};
    use crate::core::storage::MemoryObjectStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_no_destination_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let module = module(temp.path(), ToolsConfig::default());
        let mut ctx = context(&[]);

        let result = run(&module, &mut ctx).await;
        assert_eq!(result.status, StageStatus::Skipped);
        assert!(ctx.remote_path.is_none());
    }

    #[tokio::test]
    async fn test_upload_uses_stable_identifiers() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("example-site_20240101_000000.tar.gz");
        std::fs::write(&archive, vec![1u8; 2048]).unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let module = module(temp.path(), ToolsConfig::default());
        let mut ctx = context(&[(keys::NODE_UUID, "node-1"), (keys::SITE_UUID, "site-9")])
            .with_destination(Some(Destination {
                provider_id: 4,
                store: store.clone(),
            }));
        ctx.archive_path = Some(archive);

        let result = run(&module, &mut ctx).await;
        assert_eq!(result.status, StageStatus::Completed, "{}", result.message);

        let key = "backups/node-1/site-9/example-site_20240101_000000.tar.gz";
        assert_eq!(ctx.remote_path.as_deref(), Some(key));
        assert_eq!(store.get(key).unwrap().len(), 2048);
        assert_eq!(ctx.data_u64(data::UPLOADED_BYTES), Some(2048));
    }

    #[tokio::test]
    async fn test_upload_falls_back_to_names() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("a.tar.gz");
        std::fs::write(&archive, b"x").unwrap();

        let store = Arc::new(MemoryObjectStore::new());
        let module = module(temp.path(), ToolsConfig::default());
        let mut ctx = context(&[(keys::NODE_NAME, "Edge 01"), (keys::SITE_NAME, "Shop")])
            .with_destination(Some(Destination {
                provider_id: 1,
                store: store.clone(),
            }));
        ctx.archive_path = Some(archive);

        run(&module, &mut ctx).await;
        assert_eq!(ctx.remote_path.as_deref(), Some("backups/edge-01/shop/a.tar.gz"));
    }

    #[tokio::test]
    async fn test_missing_archive_fails() {
        let temp = tempfile::tempdir().unwrap();
        let module = module(temp.path(), ToolsConfig::default());
        let mut ctx = context(&[]).with_destination(Some(Destination {
            provider_id: 1,
            store: Arc::new(MemoryObjectStore::new()),
        }));

        let result = run(&module, &mut ctx).await;
        assert!(result.is_failed());
    }
}
