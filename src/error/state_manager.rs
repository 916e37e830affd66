use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RestoreStep {
    Files,
    Services,
    Databases,
}

impl std::fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestoreStep::Files => "files",
            RestoreStep::Services => "services",
            RestoreStep::Databases => "databases",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackupError {
    #[error("failed to copy `{path}` into backup slot for module `{module}`: {source}")]
    CopyFile {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to snapshot service `{unit}` for module `{module}`: {source}")]
    ServiceSnapshot {
        module: String,
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dump database `{database}` for module `{module}`: {reason}")]
    DatabaseDump {
        module: String,
        database: String,
        reason: String,
    },

    #[error("failed to write backup manifest for module `{module}`: {source}")]
    WriteManifest {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RestoreError {
    #[error("no backup slot found for module `{module}`")]
    NotFound { module: String },

    #[error("backup checksum mismatch for module `{module}`: expected `{expected}`, got `{actual}`")]
    ChecksumMismatch {
        module: String,
        expected: String,
        actual: String,
    },

    #[error("restore of module `{module}` failed at step `{step}`: {reason}")]
    Step {
        module: String,
        step: RestoreStep,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StateManagerError {
    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),
}
