use engine::error::{ConfigError, EngineError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid seed file: {0}")]
    Seed(String),

    #[error("shutdown requested")]
    ShutdownRequested,
}
