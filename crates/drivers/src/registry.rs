//! Driver registry: maps configured driver names to factories.

use crate::{
    bigquery::BigQueryDriver,
    contract::Driver,
    dynamo::DynamoDbDriver,
    error::DriverError,
    mongo::MongoDriver,
    s3db::S3dbDriver,
    sql::{
        mysql::{MySqlDriver, MySqlFlavor},
        postgres::PgDriver,
        turso::TursoDriver,
    },
    sqs::SqsDriver,
    webhook::WebhookDriver,
};
use model::store::DocumentStore;
use std::{collections::HashMap, sync::Arc};

type FactoryFn = dyn Fn(serde_json::Value) -> Result<Arc<dyn Driver>, DriverError> + Send + Sync;

/// Opens a secondary document store from opaque driver config; injected by
/// the embedder so the registry stays decoupled from store internals.
pub type StoreConnector =
    Arc<dyn Fn(serde_json::Value) -> Result<Arc<dyn DocumentStore>, DriverError> + Send + Sync>;

#[derive(Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<FactoryFn>>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        DriverRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in driver except `s3db`, which needs a
    /// [`StoreConnector`]; see [`DriverRegistry::with_store_connector`].
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.register("postgresql", |config| {
            Ok(Arc::new(PgDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("mysql", |config| {
            Ok(Arc::new(MySqlDriver::from_config(config, MySqlFlavor::MySql)?) as Arc<dyn Driver>)
        });
        registry.register("mariadb", |config| {
            Ok(Arc::new(MySqlDriver::from_config(config, MySqlFlavor::MariaDb)?) as Arc<dyn Driver>)
        });
        registry.register("planetscale", |config| {
            Ok(Arc::new(MySqlDriver::from_config(config, MySqlFlavor::PlanetScale)?)
                as Arc<dyn Driver>)
        });
        registry.register("turso", |config| {
            Ok(Arc::new(TursoDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("bigquery", |config| {
            Ok(Arc::new(BigQueryDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("dynamodb", |config| {
            Ok(Arc::new(DynamoDbDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("mongodb", |config| {
            Ok(Arc::new(MongoDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("sqs", |config| {
            Ok(Arc::new(SqsDriver::from_config(config)?) as Arc<dyn Driver>)
        });
        registry.register("webhook", |config| {
            Ok(Arc::new(WebhookDriver::from_config(config)?) as Arc<dyn Driver>)
        });

        registry
    }

    /// Adds the `s3db` same-kind backup driver, backed by the given
    /// connector.
    pub fn with_store_connector(mut self, connector: StoreConnector) -> Self {
        self.register("s3db", move |config| {
            let target = connector(config)?;
            Ok(Arc::new(S3dbDriver::new(target)) as Arc<dyn Driver>)
        });
        self
    }

    /// Registers a custom driver kind, replacing any existing entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Arc<dyn Driver>, DriverError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Driver>, DriverError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            DriverError::unsupported(format!(
                "unknown driver `{name}`; known drivers: {}",
                self.known().join(", ")
            ))
        })?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_catalogue_is_complete() {
        let registry = DriverRegistry::builtin();
        for name in [
            "postgresql",
            "mysql",
            "mariadb",
            "planetscale",
            "turso",
            "bigquery",
            "dynamodb",
            "mongodb",
            "sqs",
            "webhook",
        ] {
            assert!(registry.contains(name), "missing builtin driver {name}");
        }
        assert!(!registry.contains("s3db"), "s3db needs a store connector");
    }

    #[test]
    fn unknown_driver_lists_known_kinds() {
        let registry = DriverRegistry::builtin();
        let err = registry.create("oracle", json!({})).unwrap_err();
        assert!(err.message.contains("oracle"));
        assert!(err.message.contains("postgresql"));
    }

    #[test]
    fn s3db_registered_through_connector() {
        let registry = DriverRegistry::builtin().with_store_connector(Arc::new(|_config| {
            Ok(Arc::new(model::memory::MemoryStore::new()) as Arc<dyn DocumentStore>)
        }));
        assert!(registry.contains("s3db"));
        let driver = registry.create("s3db", json!({})).unwrap();
        assert_eq!(driver.kind(), "s3db");
    }
}
