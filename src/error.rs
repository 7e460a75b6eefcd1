use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("failed to decode persisted state: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
