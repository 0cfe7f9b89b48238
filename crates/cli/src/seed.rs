//! Seed-file loading for the embedded store: declares resources and
//! replays records through the live replication pipeline.

use crate::error::CliError;
use model::{
    core::{attribute::AttributeDecl, record::Record},
    store::DocumentStore,
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub resources: HashMap<String, SeedResource>,
}

#[derive(Debug, Deserialize)]
pub struct SeedResource {
    /// Attribute declarations, e.g. `{"email": "string|required"}`.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub records: Vec<Record>,
}

pub fn load(path: &str) -> Result<SeedFile, CliError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Declares the seed resources on the store. Called before the plugin
/// starts so schema sync sees the attribute declarations.
pub async fn declare_resources(store: &dyn DocumentStore, seed: &SeedFile) -> Result<(), CliError> {
    for (resource, spec) in &seed.resources {
        let mut attrs = Vec::with_capacity(spec.attributes.len());
        for (name, decl) in &spec.attributes {
            let attr = AttributeDecl::parse(name, decl).map_err(|e| {
                CliError::Seed(format!("attribute `{resource}.{name}`: {e}"))
            })?;
            attrs.push(attr);
        }
        store
            .create_resource(resource, &attrs)
            .await
            .map_err(engine::error::EngineError::from)?;
    }
    Ok(())
}

/// Inserts the seed records; with the plugin running they flow through
/// replication like any live write.
pub async fn apply_records(store: &dyn DocumentStore, seed: SeedFile) -> Result<u64, CliError> {
    let mut applied = 0u64;
    for (resource, spec) in seed.resources {
        for record in spec.records {
            store
                .insert(&resource, record)
                .await
                .map_err(engine::error::EngineError::from)?;
            applied += 1;
        }
    }
    info!(records = applied, "seed records applied");
    Ok(applied)
}
