use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use tracing::info;

use super::{data, tool_failure};
use crate::core::models::StageResult;
use crate::core::pipeline::process::{ToolInvocation, run_tool};
use crate::core::pipeline::{BackupContext, SiteBackupModule};
use crate::core::storage::slugify;

/// `{slug}_{YYYYmmdd_HHMMSS}.tar.gz`
pub fn archive_name(site_name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.tar.gz", slugify(site_name), at.format("%Y%m%d_%H%M%S"))
}

/// Compress the dump and the copied tree into one archive in the workspace.
pub async fn run(module: &SiteBackupModule, ctx: &mut BackupContext) -> StageResult {
    let Some(workspace) = ctx.temp_dir.clone() else {
        return StageResult::failed("Nothing to bundle: job workspace does not exist");
    };

    let mut members = Vec::new();
    if let Some(dump) = ctx.data_str(data::DUMP_PATH) {
        members.push(member_name(&workspace, dump));
    }
    if let Some(files) = ctx.data_str(data::FILES_DIR) {
        members.push(member_name(&workspace, files));
    }
    if members.is_empty() {
        return StageResult::failed("Nothing to bundle: no dump or files were produced");
    }

    let name = archive_name(&ctx.target_name, Utc::now());
    let archive_path = workspace.join(&name);

    let invocation = ToolInvocation::new(
        &module.tools.archive_command,
        Duration::from_secs(module.tools.bundle_timeout_secs),
    )
    .arg("-czf")
    .arg(archive_path.to_string_lossy())
    .arg("-C")
    .arg(workspace.to_string_lossy())
    .args(members.iter().cloned());

    {
        let _permit = module.governor.acquire_io().await;
        if let Err(e) = run_tool(&invocation, &ctx.cancel, module.tools.max_error_output).await {
            return tool_failure("Archive bundle", e);
        }
    }

    let size = match tokio::fs::metadata(&archive_path).await {
        Ok(meta) => meta.len(),
        Err(e) => return StageResult::failed(format!("Archive was not created: {}", e)),
    };
    if size == 0 {
        return StageResult::failed("Archive is empty");
    }

    let hash_path = archive_path.clone();
    let checksum = match module
        .governor
        .cpu()
        .run(move || hash_file(&hash_path))
        .await
        .and_then(|r| r)
    {
        Ok(hash) => hash,
        Err(e) => return StageResult::failed(format!("Failed to checksum archive: {}", e)),
    };

    info!(
        job_id = %ctx.job_id,
        archive = %name,
        bytes = size,
        checksum = %checksum,
        "Archive created"
    );

    ctx.archive_path = Some(archive_path);
    ctx.set_data(data::ARCHIVE_NAME, name.clone());
    ctx.set_data(data::ARCHIVE_BYTES, size);
    ctx.set_data(data::CHECKSUM, checksum.clone());

    StageResult::completed(format!("Created {} ({} bytes)", name, size)).with_details(json!({
        "archive": name,
        "bytes": size,
        "blake3": checksum,
        "members": members,
    }))
}

fn member_name(workspace: &Path, path: &str) -> String {
    let path = PathBuf::from(path);
    path.strip_prefix(workspace)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

/// BLAKE3 of a file, streamed in 128KB chunks.
fn hash_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;

    let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; 128 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
