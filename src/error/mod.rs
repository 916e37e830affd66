//! Error taxonomy.
//!
//! One `thiserror` enum per component (mirroring `error/repo_sync.rs`,
//! `error/state_manager.rs`, etc.), aggregated here into a single [`Error`] via
//! `#[from]`. [`Error::kind`] classifies any variant into the coarse taxonomy from
//! the design's error-handling section (§7), which is what the orchestrator actually
//! branches on when deciding to continue, skip, or abort.

pub mod config;
pub mod hotfix;
pub mod lock;
pub mod migration;
pub mod other;
pub mod registry;
pub mod repo_sync;
pub mod runner;
pub mod schema;
pub mod state_manager;

use config::ConfigError;
use hotfix::HotfixError;
use lock::LockError;
use migration::MigrationError;
use other::OtherError;
use registry::{ManifestError, RegistryError};
use repo_sync::RepoSyncError;
use runner::RunnerError;
use schema::SchemaUpdaterError;
use state_manager::{BackupError, RestoreError, StateManagerError};

pub type OrchestratorResult<T> = Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    RepoSync(#[from] RepoSyncError),

    #[error(transparent)]
    StateManager(#[from] StateManagerError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    SchemaUpdater(#[from] SchemaUpdaterError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Hotfix(#[from] HotfixError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] OtherError),
}

/// The coarse classification from the design's error-handling section, used by the
/// orchestrator to decide whether to continue, skip the current module, or abort the
/// whole run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Network,
    RepoState,
    Manifest,
    Backup,
    ModuleFailure,
    Restore,
    TimedOut,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RepoSync(RepoSyncError::Network { .. }) => ErrorKind::Network,
            Error::RepoSync(RepoSyncError::RepoState { .. } | RepoSyncError::BranchNotFound { .. }) => {
                ErrorKind::RepoState
            }
            Error::RepoSync(RepoSyncError::Io(_)) => ErrorKind::Internal,
            Error::Manifest(_) | Error::Registry(RegistryError::Manifest(_)) => ErrorKind::Manifest,
            Error::Registry(_) => ErrorKind::Internal,
            Error::Backup(_) | Error::StateManager(StateManagerError::Backup(_)) => ErrorKind::Backup,
            Error::Restore(_) | Error::StateManager(StateManagerError::Restore(_)) => ErrorKind::Restore,
            Error::Runner(RunnerError::TimedOut { .. }) => ErrorKind::TimedOut,
            Error::Runner(_) => ErrorKind::ModuleFailure,
            Error::Migration(MigrationError::TimedOut { .. }) => ErrorKind::TimedOut,
            Error::Migration(_) => ErrorKind::ModuleFailure,
            Error::SchemaUpdater(_) => ErrorKind::Internal,
            Error::Hotfix(_) => ErrorKind::ModuleFailure,
            Error::Lock(_) => ErrorKind::Internal,
            Error::Config(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::Internal,
            Error::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal | ErrorKind::RepoState)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(OtherError::Message(value))
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Other(OtherError::Message(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::from(RepoSyncError::BranchNotFound { url: "x".into(), branch: "y".into() }), ErrorKind::RepoState)]
    #[case(Error::from(RunnerError::TimedOut { module: "m".into(), timeout_secs: 1 }), ErrorKind::TimedOut)]
    #[case(Error::from(RunnerError::NoEntryPoint { module: "m".into() }), ErrorKind::ModuleFailure)]
    #[case(Error::from(LockError::AlreadyHeld { path: "/tmp/x".into() }), ErrorKind::Internal)]
    fn classifies_into_the_design_taxonomy(#[case] err: Error, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn internal_and_repo_state_are_the_only_fatal_kinds() {
        assert!(Error::from(LockError::AlreadyHeld { path: "/tmp/x".into() }).is_fatal());
        assert!(!Error::from(RunnerError::NoEntryPoint { module: "m".into() }).is_fatal());
    }
}
