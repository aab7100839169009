use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("statistic `{name}` is defined more than once")]
    Duplicate { name: String },
    #[error("invalid definition of `{name}`: {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to parse statistics catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    FileRead(#[from] fsutil::FileReadError),
}

pub type Result<T> = std::result::Result<T, Error>;
