use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ManifestError {
    #[error("manifest at `{path}` is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest at `{path}` is missing")]
    Missing { path: PathBuf },

    #[error(
        "manifest directory name `{dir_name}` does not match its declared module name `{name}`"
    )]
    NameMismatch { dir_name: String, name: String },

    #[error("module name `{0}` is not unique across the modules root")]
    DuplicateName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("module `{0}` is not registered")]
    UnknownModule(String),

    #[error("component `{component}` is not declared for module `{module}`")]
    UnknownComponent { module: String, component: String },

    #[error("failed to atomically rewrite manifest at `{path}`: {source}")]
    Rewrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
