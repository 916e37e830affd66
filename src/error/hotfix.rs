#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HotfixError {
    #[error("hotfix configuration at `{path}` is malformed: {source}")]
    MalformedConfig {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to copy `{source_path}` to `{destination}` for pool `{pool}`: {source}")]
    CopyOperation {
        pool: String,
        source_path: std::path::PathBuf,
        destination: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("closure command `{command}` failed for pool `{pool}` with status {code:?}")]
    ClosureFailed {
        pool: String,
        command: String,
        code: Option<i32>,
    },

    #[error(transparent)]
    Backup(#[from] crate::error::state_manager::BackupError),

    #[error(transparent)]
    Restore(#[from] crate::error::state_manager::RestoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
