use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{head} head type doesn't match the network (expected {expected}, found {found})")]
    WeightFormat { head: &'static str, expected: String, found: String },

    #[error("no values for tensor {0}")]
    MissingWeight(String),

    #[error("tensor {name} has wrong length: expected {expected}, found {found}")]
    WeightLength { name: String, expected: usize, found: usize },

    #[error("checkpoint error at '{}': {message}", path.display())]
    Checkpoint { message: String, path: PathBuf },

    #[error("data error: {0}")]
    Data(String),

    #[error("replica {0} failed before the gradient reduction")]
    Replica(usize),
}

impl Error {
    pub fn checkpoint(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Checkpoint { message: message.into(), path: path.into() }
    }
}
