use thiserror::Error;

use crate::graph::{BlockId, FunctionId};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("code graph error: {0}")]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got `{value}`")]
    InvalidInteger { name: &'static str, value: String },
}

/// Queries against blocks or functions outside the loaded program are caller
/// bugs; the infallible accessors assert on these.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown block {0:?}")]
    UnknownBlock(BlockId),
    #[error("unknown function {0:?}")]
    UnknownFunction(FunctionId),
}
