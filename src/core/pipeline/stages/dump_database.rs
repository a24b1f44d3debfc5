use serde_json::json;
use tokio::time::Duration;
use tracing::info;

use super::{data, tool_failure};
use crate::core::models::StageResult;
use crate::core::pipeline::process::{ToolInvocation, run_tool};
use crate::core::pipeline::{BackupContext, SiteBackupModule, keys};

/// Dump the site database to `database.sql` in the job workspace.
pub async fn run(module: &SiteBackupModule, ctx: &mut BackupContext) -> StageResult {
    let Some(db_name) = ctx.config_value(keys::DB_NAME).map(str::to_string) else {
        return StageResult::failed("Database name is not configured");
    };

    let workspace = match ctx.ensure_temp_dir(&module.storage.work_dir) {
        Ok(dir) => dir,
        Err(e) => return StageResult::failed(format!("Failed to create workspace: {}", e)),
    };
    let dump_path = workspace.join("database.sql");

    let mut invocation = ToolInvocation::new(
        &module.tools.dump_command,
        Duration::from_secs(module.tools.dump_timeout_secs),
    )
    .args(["--single-transaction", "--quick", "--no-tablespaces"])
    .stdout_file(&dump_path);

    if let Some(host) = ctx.config_value(keys::DB_HOST) {
        invocation = invocation.arg(format!("--host={}", host));
    }
    if let Some(port) = ctx.config_value(keys::DB_PORT) {
        invocation = invocation.arg(format!("--port={}", port));
    }
    if let Some(user) = ctx.config_value(keys::DB_USER) {
        invocation = invocation.arg(format!("--user={}", user));
    }
    // Password goes through the environment so it never shows up in `ps`
    if let Some(password) = ctx.config_value(keys::DB_PASSWORD) {
        invocation = invocation.env("MYSQL_PWD", password);
    }
    let invocation = invocation.arg(&db_name);

    let _permit = module.governor.acquire_io().await;

    let output = match run_tool(&invocation, &ctx.cancel, module.tools.max_error_output).await {
        Ok(output) => output,
        Err(e) => return tool_failure("Database dump", e),
    };

    let size = match tokio::fs::metadata(&dump_path).await {
        Ok(meta) => meta.len(),
        Err(e) => return StageResult::failed(format!("Database dump missing: {}", e)),
    };
    if size == 0 {
        return StageResult::failed("Database dump is empty");
    }

    info!(
        job_id = %ctx.job_id,
        database = %db_name,
        bytes = size,
        elapsed_ms = output.elapsed.as_millis() as u64,
        "Database dumped"
    );

    ctx.set_data(data::DUMP_PATH, dump_path.to_string_lossy().to_string());
    ctx.set_data(data::DUMP_BYTES, size);

    StageResult::completed(format!("Dumped database {} ({} bytes)", db_name, size))
        .with_details(json!({ "bytes": size, "database": db_name }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::core::models::StageStatus;
    use crate::core::pipeline::stages::test_support::{context, module, script};

    fn tools(command: &std::path::Path) -> ToolsConfig {
        ToolsConfig {
            dump_command: command.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dump_writes_file_and_records_size() {
        let temp = tempfile::tempdir().unwrap();
        let tool = script(temp.path(), "dump.sh", "echo 'CREATE TABLE wp_posts (id int);'");
        let module = module(temp.path(), tools(&tool));
        let mut ctx = context(&[(keys::DB_NAME, "wordpress"), (keys::DB_PASSWORD, "secret")]);

        let result = run(&module, &mut ctx).await;

        assert_eq!(result.status, StageStatus::Completed, "{}", result.message);
        assert!(ctx.data_u64(data::DUMP_BYTES).unwrap() > 0);
        let dump = ctx.data_str(data::DUMP_PATH).unwrap();
        assert!(std::fs::read_to_string(dump).unwrap().contains("wp_posts"));
    }

    #[tokio::test]
    async fn test_password_passed_through_environment() {
        let temp = tempfile::tempdir().unwrap();
        let tool = script(temp.path(), "dump.sh", "echo \"pw=$MYSQL_PWD args=$*\"");
        let module = module(temp.path(), tools(&tool));
        let mut ctx = context(&[(keys::DB_NAME, "wordpress"), (keys::DB_PASSWORD, "secret")]);

        run(&module, &mut ctx).await;

        let dump = std::fs::read_to_string(ctx.data_str(data::DUMP_PATH).unwrap()).unwrap();
        assert!(dump.contains("pw=secret"));
        let args = dump.split("args=").nth(1).unwrap();
        assert!(!args.contains("secret"));
        assert!(args.trim_end().ends_with("wordpress"));
    }

    #[tokio::test]
    async fn test_empty_dump_fails() {
        let temp = tempfile::tempdir().unwrap();
        let tool = script(temp.path(), "dump.sh", "exit 0");
        let module = module(temp.path(), tools(&tool));
        let mut ctx = context(&[(keys::DB_NAME, "wordpress")]);

        let result = run(&module, &mut ctx).await;
        assert!(result.is_failed());
        assert_eq!(result.message, "Database dump is empty");
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let tool = script(
            temp.path(),
            "dump.sh",
            "echo 'Access denied for user wp' >&2; exit 2",
        );
        let module = module(temp.path(), tools(&tool));
        let mut ctx = context(&[(keys::DB_NAME, "wordpress")]);

        let result = run(&module, &mut ctx).await;
        assert!(result.is_failed());
        assert!(result.message.contains("Access denied for user wp"));
        assert!(result.message.contains("exit 2"));
    }

    #[tokio::test]
    async fn test_missing_database_name_fails() {
        let temp = tempfile::tempdir().unwrap();
        let module = module(temp.path(), ToolsConfig::default());
        let mut ctx = context(&[]);

        let result = run(&module, &mut ctx).await;
        assert!(result.is_failed());
        assert!(ctx.temp_dir.is_none());
    }
}
