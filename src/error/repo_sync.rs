use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RepoSyncError {
    #[error("upstream repository `{url}` is unreachable: {source}")]
    Network {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("staging tree at `{path}` is corrupt or has diverged from upstream: {source}")]
    RepoState {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("branch `{branch}` not found on remote `{url}`")]
    BranchNotFound { url: String, branch: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
