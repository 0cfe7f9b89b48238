use model::store::StoreError;
use thiserror::Error;

/// Fatal configuration problems; raised at startup, never at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown driver `{name}`; known drivers: {}", known.join(", "))]
    UnknownDriver { name: String, known: Vec<String> },

    #[error("unknown transform function `{0}`")]
    UnknownTransform(String),

    #[error("unknown predicate function `{0}`")]
    UnknownPredicate(String),

    #[error("invalid resource mapping: {0}")]
    InvalidMapping(String),

    #[error("invalid config for driver `{driver}`: {message}")]
    Driver { driver: String, message: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown replicator `{id}`; known replicators: {}", known.join(", "))]
    UnknownReplicator { id: String, known: Vec<String> },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Schema mismatch under `on_mismatch = error`; halts startup.
    #[error("schema sync failed: {0}")]
    SchemaSync(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
