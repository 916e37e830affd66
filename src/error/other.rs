#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OtherError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
