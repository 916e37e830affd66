#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MigrationError {
    #[error("migration catalog at `{path}` is malformed: {source}")]
    MalformedCatalog {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("migration script for id `{id}` is missing at `{path}`")]
    ScriptMissing { id: String, path: std::path::PathBuf },

    #[error("migration `{id}` exited non-zero ({code:?}); will retry on a future run")]
    Failed { id: String, code: Option<i32> },

    #[error("migration `{id}` exceeded its timeout of {timeout_secs}s and was killed")]
    TimedOut { id: String, timeout_secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
