//! The plugin surface: lifecycle, configuration validation, and the
//! small public API (list, enable/disable, manual sync).

use crate::{
    bus::EventBus,
    config::{PluginConfig, ReplicatorSpec},
    engine::{ReplicationEngine, ReplicatorRuntime},
    error::{ConfigError, EngineError},
    logstore::ReplicatorLog,
    mapping::{self, FnRegistry},
    metrics::{Metrics, MetricsSnapshot},
    schema_sync::{self, TableLocks},
};
use chrono::Utc;
use drivers::registry::DriverRegistry;
use model::{
    core::mutation::MutationEvent,
    events::ReplicationEvent,
    store::DocumentStore,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ReplicatorInfo {
    pub id: String,
    pub driver: String,
    pub enabled: bool,
    pub resources: Vec<String>,
}

enum PluginState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// The replication plugin. Lifecycle: `new` → `init` → `start` → `stop`.
pub struct ReplicatorPlugin {
    config: PluginConfig,
    store: Arc<dyn DocumentStore>,
    registry: DriverRegistry,
    fns: FnRegistry,
    bus: EventBus,
    metrics: Metrics,
    engine: Option<Arc<ReplicationEngine>>,
    log: Option<Arc<ReplicatorLog>>,
    state: PluginState,
}

fn replicator_id(spec: &ReplicatorSpec, index: usize) -> String {
    spec.id
        .clone()
        .unwrap_or_else(|| format!("{}-{index}", spec.driver))
}

impl ReplicatorPlugin {
    pub fn new(
        config: PluginConfig,
        store: Arc<dyn DocumentStore>,
        registry: DriverRegistry,
        fns: FnRegistry,
    ) -> Self {
        ReplicatorPlugin {
            config,
            store,
            registry,
            fns,
            bus: EventBus::new(),
            metrics: Metrics::new(),
            engine: None,
            log: None,
            state: PluginState::Created,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Arc<ReplicationEvent>> {
        self.bus.subscribe().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validates configuration and builds the replicator runtimes.
    /// No connection is established here.
    pub async fn init(&mut self) -> Result<(), ConfigError> {
        let mut runtimes = Vec::with_capacity(self.config.replicators.len());

        if self.config.replicators.is_empty() {
            self.bus
                .publish(ReplicationEvent::ConfigWarning {
                    replicator: None,
                    message: "no replicators configured".to_string(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        for (index, spec) in self.config.replicators.iter().enumerate() {
            let id = replicator_id(spec, index);

            if !self.registry.contains(&spec.driver) {
                return Err(ConfigError::UnknownDriver {
                    name: spec.driver.clone(),
                    known: self.registry.known(),
                });
            }

            let bindings = mapping::resolve_bindings(&spec.resources, &self.fns)?;
            for (resource, binding) in &bindings {
                if binding.is_inert() {
                    warn!(replicator = %id, resource = %resource, "binding has an empty action set and will never fire");
                    self.bus
                        .publish(ReplicationEvent::ConfigWarning {
                            replicator: Some(id.clone()),
                            message: format!(
                                "binding for `{resource}` has an empty action set"
                            ),
                            timestamp: Utc::now(),
                        })
                        .await;
                }
            }

            let driver = self
                .registry
                .create(&spec.driver, spec.config.clone())
                .map_err(|e| ConfigError::Driver {
                    driver: spec.driver.clone(),
                    message: e.to_string(),
                })?;

            runtimes.push(Arc::new(ReplicatorRuntime {
                id,
                driver,
                bindings: mapping::group_by_resource(bindings),
                enabled: AtomicBool::new(spec.enabled),
                schema_opts: spec.schema.clone(),
                table_locks: TableLocks::new(),
            }));
        }

        let log = Arc::new(ReplicatorLog::new(
            self.store.clone(),
            self.config.replicator_log_resource.clone(),
            self.config.persist_replicator_log,
            self.config.log_errors,
            self.config.dead_letter_resource.clone(),
            self.bus.clone(),
        ));

        let engine = Arc::new(ReplicationEngine::new(
            runtimes,
            self.bus.clone(),
            log.clone(),
            self.metrics.clone(),
            &self.config,
        ));

        self.log = Some(log);
        self.engine = Some(engine);
        self.state = PluginState::Initialized;
        Ok(())
    }

    /// Runs schema sync for capable drivers, opens the log collection,
    /// and subscribes the engine to the source store.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if !self.config.enabled {
            info!("replicator plugin disabled by configuration");
            self.bus
                .publish(ReplicationEvent::ConfigWarning {
                    replicator: None,
                    message: "plugin disabled; no replication will occur".to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            return Ok(());
        }

        if matches!(self.state, PluginState::Created) {
            self.init().await?;
        }
        let engine = self.engine.as_ref().expect("init builds the engine").clone();
        let log = self.log.as_ref().expect("init builds the log").clone();

        log.init().await;

        for runtime in engine.runtimes() {
            if !runtime.is_enabled() {
                continue;
            }
            if runtime.driver.schema_sync().is_some() {
                runtime
                    .driver
                    .init()
                    .await
                    .map_err(|e| EngineError::SchemaSync(e.to_string()))?;
            }
            schema_sync::sync_replicator(
                &runtime.id,
                runtime.driver.as_ref(),
                &runtime.bindings,
                self.store.as_ref(),
                &runtime.schema_opts,
                &self.bus,
                &runtime.table_locks,
            )
            .await?;
        }

        let events = self.store.subscribe().await;
        engine.start(events).await;
        self.state = PluginState::Running;
        Ok(())
    }

    /// Stops accepting events, drains in-flight work, and closes drivers.
    pub async fn stop(&mut self) {
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
        self.state = PluginState::Stopped;
    }

    pub fn replicators(&self) -> Vec<ReplicatorInfo> {
        let Some(engine) = &self.engine else {
            return Vec::new();
        };
        engine
            .runtimes()
            .iter()
            .map(|rt| {
                let mut resources: Vec<String> = rt.bindings.keys().cloned().collect();
                resources.sort();
                ReplicatorInfo {
                    id: rt.id.clone(),
                    driver: rt.driver.kind().to_string(),
                    enabled: rt.is_enabled(),
                    resources,
                }
            })
            .collect()
    }

    fn known_ids(&self) -> Vec<String> {
        self.replicators().into_iter().map(|info| info.id).collect()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), EngineError> {
        let engine = self.engine.as_ref().ok_or_else(|| EngineError::UnknownReplicator {
            id: id.to_string(),
            known: Vec::new(),
        })?;
        let runtime = engine.runtime(id).ok_or_else(|| EngineError::UnknownReplicator {
            id: id.to_string(),
            known: self.known_ids(),
        })?;
        runtime.enabled.store(enabled, Ordering::SeqCst);
        info!(replicator = %id, enabled, "replicator toggled");
        Ok(())
    }

    /// Manual full sync: replays every record of `resource` through one
    /// replicator as if it had just been inserted. Returns the number of
    /// records replayed.
    pub async fn sync(&self, id: &str, resource: &str) -> Result<u64, EngineError> {
        let engine = self.engine.as_ref().ok_or_else(|| EngineError::UnknownReplicator {
            id: id.to_string(),
            known: Vec::new(),
        })?;
        let runtime = engine.runtime(id).ok_or_else(|| EngineError::UnknownReplicator {
            id: id.to_string(),
            known: self.known_ids(),
        })?;

        let records = self.store.list(resource).await?;
        let mut replayed = 0u64;
        for record in records {
            let record_id = model::core::record::record_id(&record).unwrap_or_default();
            let event = MutationEvent::inserted(resource, &record_id, record);
            engine.process_direct(&runtime, event).await?;
            replayed += 1;
        }
        info!(replicator = %id, resource, replayed, "manual sync completed");
        Ok(replayed)
    }

    /// Resolves mappings and reports non-fatal findings without touching
    /// any destination. Fatal problems surface as `Err`.
    pub fn validate(
        config: &PluginConfig,
        registry: &DriverRegistry,
        fns: &FnRegistry,
    ) -> Result<Vec<String>, ConfigError> {
        let mut findings = Vec::new();

        if !config.enabled {
            findings.push("plugin is disabled".to_string());
        }
        if config.replicators.is_empty() {
            findings.push("no replicators configured".to_string());
        }

        for (index, spec) in config.replicators.iter().enumerate() {
            let id = replicator_id(spec, index);
            if !registry.contains(&spec.driver) {
                return Err(ConfigError::UnknownDriver {
                    name: spec.driver.clone(),
                    known: registry.known(),
                });
            }
            let bindings = mapping::resolve_bindings(&spec.resources, fns)?;
            for (resource, binding) in &bindings {
                if binding.is_inert() {
                    findings.push(format!(
                        "replicator `{id}`: binding for `{resource}` has an empty action set"
                    ));
                }
            }
            if !spec.enabled {
                findings.push(format!("replicator `{id}` is disabled"));
            }
        }

        Ok(findings)
    }
}
