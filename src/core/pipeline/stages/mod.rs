pub mod archive_files;
pub mod cleanup;
pub mod create_bundle;
pub mod dump_database;
pub mod upload_remote;

use super::process::ToolError;
use crate::core::models::StageResult;

/// Data-bag keys shared between stages.
pub(crate) mod data {
    pub const DUMP_PATH: &str = "dump_path";
    pub const DUMP_BYTES: &str = "dump_bytes";
    pub const FILES_DIR: &str = "files_dir";
    pub const FILES_COPIED: &str = "files_copied";
    pub const FILES_SKIPPED: &str = "files_skipped";
    pub const ARCHIVE_NAME: &str = "archive_name";
    pub const ARCHIVE_BYTES: &str = "archive_bytes";
    pub const CHECKSUM: &str = "checksum";
    pub const UPLOADED_BYTES: &str = "uploaded_bytes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    DumpDatabase,
    ArchiveFiles,
    CreateBundle,
    UploadRemote,
    Cleanup,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        Self::DumpDatabase,
        Self::ArchiveFiles,
        Self::CreateBundle,
        Self::UploadRemote,
        Self::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DumpDatabase => "dump_database",
            Self::ArchiveFiles => "archive_files",
            Self::CreateBundle => "create_bundle",
            Self::UploadRemote => "upload_remote",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

/// Failed result carrying the tool's own error output.
pub(crate) fn tool_failure(action: &str, err: ToolError) -> StageResult {
    let message = match err {
        ToolError::Exit { stderr, code, .. } if !stderr.is_empty() => {
            format!("{} failed (exit {}): {}", action, exit_code(code), stderr)
        }
        ToolError::Exit { code, .. } => format!("{} failed (exit {})", action, exit_code(code)),
        other => format!("{} failed: {}", action, other),
    };
    StageResult::failed(message)
}

fn exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(StageName::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageName::parse("compress"), None);
    }

    #[test]
    fn test_tool_failure_keeps_stderr_verbatim() {
        let result = tool_failure(
            "Database dump",
            ToolError::Exit {
                program: "mysqldump".to_string(),
                code: Some(2),
                stderr: "mysqldump: Got error: 1045: Access denied".to_string(),
            },
        );
        assert!(result.is_failed());
        assert_eq!(
            result.message,
            "Database dump failed (exit 2): mysqldump: Got error: 1045: Access denied"
        );
    }
}
