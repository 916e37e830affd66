use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SchemaUpdaterError {
    #[error("failed to rename installed directory for module `{module}` aside: {source}")]
    RenameAside {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename staging copy of module `{module}` into place, reverted: {source}")]
    RenameIn {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove stale directory `{path}` after refreshing module `{module}`")]
    RemoveStale { module: String, path: PathBuf },

    #[error(transparent)]
    Backup(#[from] crate::error::state_manager::BackupError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
