use serde_json::json;
use tracing::debug;

use crate::core::models::StageResult;
use crate::core::pipeline::BackupContext;

/// Remove the job workspace. Nothing to remove is a skip, not a failure.
pub async fn run(ctx: &mut BackupContext) -> StageResult {
    let Some(dir) = ctx.temp_dir.clone() else {
        return StageResult::skipped("No workspace to clean up");
    };

    if !dir.exists() {
        ctx.temp_dir = None;
        return StageResult::skipped("Workspace already removed");
    }

    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            debug!(job_id = %ctx.job_id, path = %dir.display(), "Workspace removed");
            ctx.temp_dir = None;
            ctx.archive_path = None;
            StageResult::completed("Workspace removed")
                .with_details(json!({ "path": dir.display().to_string() }))
        }
        Err(e) => StageResult::failed(format!(
            "Failed to remove workspace {}: {}",
            dir.display(),
            e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::StageStatus;
    use crate::core::pipeline::stages::test_support::context;

    #[tokio::test]
    async fn test_cleanup_removes_workspace() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(&[]);
        let dir = ctx.ensure_temp_dir(work.path()).unwrap();
        std::fs::write(dir.join("database.sql"), b"x").unwrap();

        let result = run(&mut ctx).await;
        assert_eq!(result.status, StageStatus::Completed);
        assert!(!dir.exists());
        assert!(ctx.temp_dir.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_without_workspace_is_skipped() {
        let mut ctx = context(&[]);
        let result = run(&mut ctx).await;
        assert_eq!(result.status, StageStatus::Skipped);
    }
}
