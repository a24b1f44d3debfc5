//! Copy the site's content tree into the job workspace.
//!
//! Unreadable entries are skipped and counted instead of failing the stage, so a
//! single locked file never costs the whole backup.

use anyhow::{Result, anyhow, bail};
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::data;
use crate::core::models::StageResult;
use crate::core::pipeline::{BackupContext, SiteBackupModule, keys};
use crate::logging::LogThrottle;

/// Buffer size for file I/O (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Skipped entries listed in the stage details
const MAX_REPORTED_SKIPS: usize = 10;

#[derive(Debug, Default)]
struct CopyReport {
    files: u64,
    bytes: u64,
    skipped: Vec<SkippedEntry>,
}

#[derive(Debug)]
struct SkippedEntry {
    path: String,
    reason: String,
}

impl CopyReport {
    fn skip(&mut self, path: &Path, err: &io::Error) {
        warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
        self.skipped.push(SkippedEntry {
            path: path.display().to_string(),
            reason: err.to_string(),
        });
    }
}

pub async fn run(module: &SiteBackupModule, ctx: &mut BackupContext) -> StageResult {
    let Some(source) = ctx.config_value(keys::CONTENT_PATH).map(PathBuf::from) else {
        return StageResult::failed("Content path is not configured");
    };
    if !source.is_dir() {
        return StageResult::failed(format!(
            "Content path {} is not a directory",
            source.display()
        ));
    }

    let workspace = match ctx.ensure_temp_dir(&module.storage.work_dir) {
        Ok(dir) => dir,
        Err(e) => return StageResult::failed(format!("Failed to create workspace: {}", e)),
    };
    let destination = workspace.join("files");

    let _permit = module.governor.acquire_io().await;

    let cancel = ctx.cancel.clone();
    let counter = ctx.byte_counter();
    let dest = destination.clone();
    let outcome = module
        .governor
        .cpu()
        .run(move || copy_tree(&source, &dest, &cancel, &counter))
        .await
        .and_then(|r| r);

    let report = match outcome {
        Ok(report) => report,
        Err(e) => return StageResult::failed(format!("File archive failed: {}", e)),
    };

    info!(
        job_id = %ctx.job_id,
        files = report.files,
        bytes = report.bytes,
        skipped = report.skipped.len(),
        "Content copied"
    );

    ctx.set_data(data::FILES_DIR, destination.to_string_lossy().to_string());
    ctx.set_data(data::FILES_COPIED, report.files);
    ctx.set_data(data::FILES_SKIPPED, report.skipped.len() as u64);

    let mut message = format!("Copied {} files ({} bytes)", report.files, report.bytes);
    if !report.skipped.is_empty() {
        message.push_str(&format!(", skipped {} unreadable", report.skipped.len()));
    }

    let skipped: Vec<_> = report
        .skipped
        .iter()
        .take(MAX_REPORTED_SKIPS)
        .map(|s| json!({ "path": s.path, "error": s.reason }))
        .collect();

    StageResult::completed(message).with_details(json!({
        "files": report.files,
        "bytes": report.bytes,
        "skipped_count": report.skipped.len(),
        "skipped": skipped,
    }))
}

fn copy_tree(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
    counter: &Arc<AtomicU64>,
) -> Result<CopyReport> {
    fs::create_dir_all(destination)
        .map_err(|e| anyhow!("Failed to create {}: {}", destination.display(), e))?;

    let mut report = CopyReport::default();
    let throttle = LogThrottle::new(Duration::from_secs(2));
    copy_dir(source, destination, &mut report, cancel, counter, &throttle)?;
    Ok(report)
}

fn copy_dir(
    source: &Path,
    destination: &Path,
    report: &mut CopyReport,
    cancel: &CancellationToken,
    counter: &Arc<AtomicU64>,
    throttle: &LogThrottle,
) -> Result<()> {
    let entries = match fs::read_dir(source) {
        Ok(entries) => entries,
        Err(e) if is_skippable(&e) => {
            report.skip(source, &e);
            return Ok(());
        }
        Err(e) => bail!("Failed to read directory {}: {}", source.display(), e),
    };

    for entry in entries {
        if cancel.is_cancelled() {
            bail!("cancelled");
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_skippable(&e) => {
                report.skip(source, &e);
                continue;
            }
            Err(e) => bail!("Failed to read directory entry in {}: {}", source.display(), e),
        };

        let path = entry.path();
        let target = destination.join(entry.file_name());

        // symlink_metadata so links are not followed out of the tree
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) if is_skippable(&e) => {
                report.skip(&path, &e);
                continue;
            }
            Err(e) => bail!("Failed to stat {}: {}", path.display(), e),
        };

        if metadata.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| anyhow!("Failed to create {}: {}", target.display(), e))?;
            copy_dir(&path, &target, report, cancel, counter, throttle)?;
            if let Err(e) = fs::set_permissions(&target, metadata.permissions()) {
                debug!(path = %target.display(), error = %e, "Failed to set directory permissions");
            }
        } else if metadata.is_file() {
            match copy_file(&path, &target) {
                Ok(bytes) => {
                    report.files += 1;
                    report.bytes += bytes;
                    let total = counter.fetch_add(bytes, Ordering::Relaxed) + bytes;
                    if throttle.should_log() {
                        debug!(files = report.files, bytes = total, "Copy progress");
                    }
                }
                Err(e) if is_skippable(&e) => report.skip(&path, &e),
                Err(e) => bail!("Failed to copy {}: {}", path.display(), e),
            }
        } else if metadata.file_type().is_symlink() {
            match fs::read_link(&path) {
                Ok(link) => {
                    if let Err(e) = std::os::unix::fs::symlink(&link, &target) {
                        debug!(path = %path.display(), error = %e, "Failed to recreate symlink");
                    }
                }
                Err(e) => report.skip(&path, &e),
            }
        }
        // Sockets, fifos and devices are not content
    }

    Ok(())
}

fn copy_file(source: &Path, dest: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(source)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(source)?);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, File::create(dest)?);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        written += n as u64;
    }
    writer.flush()?;

    if let Err(e) = fs::set_permissions(dest, metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(written)
}

/// Permission problems and files vanishing mid-walk are partial failures.
fn is_skippable(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::PermissionDenied | ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::core::models::StageStatus;
    use crate::core::pipeline::stages::test_support::{context, module};
    use std::os::unix::fs::PermissionsExt;

    fn site_tree(root: &Path) -> PathBuf {
        let content = root.join("public_html");
        fs::create_dir_all(content.join("wp-content/uploads")).unwrap();
        fs::write(content.join("index.php"), b"<?php // index").unwrap();
        fs::write(content.join("wp-config.php"), b"<?php define('DB_NAME', 'wp');").unwrap();
        fs::write(content.join("wp-content/uploads/photo.jpg"), vec![7u8; 4096]).unwrap();
        content
    }

    #[tokio::test]
    async fn test_copies_tree_with_content_and_mtime() {
        let temp = tempfile::tempdir().unwrap();
        let content = site_tree(temp.path());
        let old = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(content.join("index.php"), old).unwrap();

        let module = module(&temp.path().join("work"), ToolsConfig::default());
        let path = content.to_string_lossy().to_string();
        let mut ctx = context(&[(keys::CONTENT_PATH, path.as_str())]);

        let result = run(&module, &mut ctx).await;
        assert_eq!(result.status, StageStatus::Completed, "{}", result.message);
        assert_eq!(ctx.data_u64(data::FILES_COPIED), Some(3));
        assert_eq!(ctx.data_u64(data::FILES_SKIPPED), Some(0));

        let files = PathBuf::from(ctx.data_str(data::FILES_DIR).unwrap());
        assert_eq!(
            fs::read(files.join("wp-content/uploads/photo.jpg")).unwrap(),
            vec![7u8; 4096]
        );
        let meta = fs::metadata(files.join("index.php")).unwrap();
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), old);
        assert!(ctx.bytes_processed() >= 4096);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_skipped_and_counted() {
        let temp = tempfile::tempdir().unwrap();
        let content = site_tree(temp.path());
        let locked = content.join("locked.log");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        if File::open(&locked).is_ok() {
            // Privileged user ignores file modes; nothing to skip
            return;
        }

        let module = module(&temp.path().join("work"), ToolsConfig::default());
        let path = content.to_string_lossy().to_string();
        let mut ctx = context(&[(keys::CONTENT_PATH, path.as_str())]);

        let result = run(&module, &mut ctx).await;
        assert_eq!(result.status, StageStatus::Completed);
        assert_eq!(ctx.data_u64(data::FILES_SKIPPED), Some(1));
        assert!(result.message.contains("skipped 1 unreadable"));
        assert_eq!(result.details["skipped_count"], 1);
    }

    #[tokio::test]
    async fn test_missing_content_path_fails() {
        let temp = tempfile::tempdir().unwrap();
        let module = module(temp.path(), ToolsConfig::default());
        let missing = temp.path().join("nope").to_string_lossy().to_string();
        let mut ctx = context(&[(keys::CONTENT_PATH, missing.as_str())]);

        let result = run(&module, &mut ctx).await;
        assert!(result.is_failed());
        assert!(result.message.contains("is not a directory"));
    }

    #[test]
    fn test_skippable_errors() {
        assert!(is_skippable(&io::Error::new(ErrorKind::PermissionDenied, "denied")));
        assert!(is_skippable(&io::Error::new(ErrorKind::NotFound, "gone")));
        assert!(!is_skippable(&io::Error::new(ErrorKind::StorageFull, "full")));
    }
}
