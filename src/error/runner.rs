#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    #[error("module `{module}` has no executable entry point (`index.*`) in its directory")]
    NoEntryPoint { module: String },

    #[error("failed to spawn module `{module}`: {source}")]
    Spawn {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module `{module}` exceeded its timeout of {timeout_secs}s and was killed")]
    TimedOut { module: String, timeout_secs: u64 },

    #[error("module `{module}` produced an unparseable status envelope: {reason}")]
    UnparseableEnvelope { module: String, reason: String },

    #[error("module `{module}` exited with status {code:?} and reported failure: {message}")]
    ModuleFailure {
        module: String,
        code: Option<i32>,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
