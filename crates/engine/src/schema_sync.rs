//! Drives schema reconciliation for replicators whose drivers advertise
//! the capability: introspect, plan, apply.

use crate::{bus::EventBus, error::EngineError, mapping::Binding};
use chrono::Utc;
use drivers::contract::Driver;
use model::store::DocumentStore;
use model::{core::attribute::AttributeDecl, events::ReplicationEvent};
use schema::{
    ddl, mapper,
    plan::{OnMismatch, SchemaDiff, SchemaPlan, SyncOptions, SyncStrategy},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Per-table exclusive locks: schema sync writes, replicate calls read.
#[derive(Clone, Default)]
pub struct TableLocks {
    inner: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_table(&self, table: &str) -> Arc<RwLock<()>> {
        let mut locks = self.inner.lock().await;
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

/// Runs schema sync for every (resource, destination table) of one
/// replicator. Returns the number of tables touched.
#[allow(clippy::too_many_arguments)]
pub async fn sync_replicator(
    replicator_id: &str,
    driver: &dyn Driver,
    bindings: &HashMap<String, Vec<Binding>>,
    store: &dyn DocumentStore,
    opts: &SyncOptions,
    bus: &EventBus,
    locks: &TableLocks,
) -> Result<usize, EngineError> {
    let Some(sync) = driver.schema_sync() else {
        return Ok(0);
    };

    let started = Instant::now();
    let mut synced_tables = 0usize;
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for (resource, resource_bindings) in bindings {
        let attrs: Vec<AttributeDecl> = match store.attributes(resource).await {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!(resource = %resource, error = %e, "cannot read source attributes, skipping schema sync");
                bus.publish(ReplicationEvent::ConfigWarning {
                    replicator: Some(replicator_id.to_string()),
                    message: format!("schema sync skipped for `{resource}`: {e}"),
                    timestamp: Utc::now(),
                })
                .await;
                continue;
            }
        };

        for binding in resource_bindings {
            let table = binding.destination.clone();
            if !seen.insert((resource.clone(), table.clone())) {
                continue;
            }

            let tracking = sync.tracking_columns(resource);
            let family = sync.dialect().family();
            let expected = mapper::table_columns(&attrs, family, tracking);

            let lock = locks.for_table(&table).await;
            let _guard = lock.write().await;

            let actual = match sync.introspect(&table).await {
                Ok(actual) => actual,
                Err(e) => {
                    handle_failure(
                        replicator_id,
                        &table,
                        format!("introspection failed: {e}"),
                        opts.on_mismatch,
                        bus,
                    )
                    .await?;
                    continue;
                }
            };

            let plan = schema::plan::build_plan(&table, &expected, actual.as_deref(), opts);
            if plan.is_empty() {
                continue;
            }

            match opts.strategy {
                SyncStrategy::ValidateOnly => {
                    handle_failure(
                        replicator_id,
                        &table,
                        plan.mismatch_details(),
                        opts.on_mismatch,
                        bus,
                    )
                    .await?;
                }
                SyncStrategy::Alter | SyncStrategy::DropCreate => {
                    let diff =
                        match apply_plan(sync.dialect(), &plan, &expected, driver).await {
                            Ok(diff) => diff,
                            Err(message) => {
                                handle_failure(replicator_id, &table, message, opts.on_mismatch, bus)
                                    .await?;
                                continue;
                            }
                        };
                    if !diff.is_noop() {
                        synced_tables += 1;
                    }
                    publish_diff(replicator_id, &table, &expected, &diff, bus).await;

                    // Type drift is not repaired by ALTER; report it.
                    if opts.strategy == SyncStrategy::Alter && !plan.columns_mismatch.is_empty() {
                        handle_failure(
                            replicator_id,
                            &table,
                            plan.mismatch_details(),
                            opts.on_mismatch,
                            bus,
                        )
                        .await?;
                    }
                }
            }
        }
    }

    bus.publish(ReplicationEvent::SchemaSyncCompleted {
        replicator: replicator_id.to_string(),
        tables: synced_tables,
        duration_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    })
    .await;

    Ok(synced_tables)
}

/// Executes the DDL a plan calls for and reports what actually changed.
async fn apply_plan(
    dialect: &dyn schema::dialect::Dialect,
    plan: &SchemaPlan,
    expected: &[mapper::ColumnSpec],
    driver: &dyn Driver,
) -> Result<SchemaDiff, String> {
    let sync = driver.schema_sync().ok_or("schema sync unsupported")?;
    let table = &plan.table_name;
    let mut diff = SchemaDiff::default();

    match plan.strategy {
        SyncStrategy::DropCreate => {
            warn!(table = %table, "drop-create strategy: destination data will be lost");
            sync.execute_ddl(&ddl::drop_table(dialect, table))
                .await
                .map_err(|e| e.to_string())?;
            sync.execute_ddl(&ddl::create_table(dialect, table, expected))
                .await
                .map_err(|e| e.to_string())?;
            diff.recreated = true;
        }
        SyncStrategy::Alter => {
            if plan.create_if_missing {
                sync.execute_ddl(&ddl::create_table(dialect, table, expected))
                    .await
                    .map_err(|e| e.to_string())?;
                info!(table = %table, columns = expected.len(), "created destination table");
                diff.created = true;
            } else {
                for column in &plan.columns_to_add {
                    sync.execute_ddl(&ddl::add_column(dialect, table, column))
                        .await
                        .map_err(|e| e.to_string())?;
                    diff.added_columns.push(column.name.clone());
                }
                for column in &plan.columns_to_drop {
                    sync.execute_ddl(&ddl::drop_column(dialect, table, column))
                        .await
                        .map_err(|e| e.to_string())?;
                    diff.dropped_columns.push(column.clone());
                }
                if !diff.added_columns.is_empty() {
                    info!(
                        table = %table,
                        added = diff.added_columns.len(),
                        "altered destination table"
                    );
                }
            }
        }
        SyncStrategy::ValidateOnly => {}
    }

    Ok(diff)
}

async fn publish_diff(
    replicator_id: &str,
    table: &str,
    expected: &[mapper::ColumnSpec],
    diff: &SchemaDiff,
    bus: &EventBus,
) {
    if diff.recreated {
        bus.publish(ReplicationEvent::TableRecreated {
            replicator: replicator_id.to_string(),
            table: table.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }
    if diff.created {
        bus.publish(ReplicationEvent::TableCreated {
            replicator: replicator_id.to_string(),
            table: table.to_string(),
            columns: expected.len(),
            timestamp: Utc::now(),
        })
        .await;
    }
    if !diff.added_columns.is_empty() {
        bus.publish(ReplicationEvent::TableAltered {
            replicator: replicator_id.to_string(),
            table: table.to_string(),
            added_columns: diff.added_columns.len(),
            timestamp: Utc::now(),
        })
        .await;
    }
}

async fn handle_failure(
    replicator_id: &str,
    table: &str,
    details: String,
    on_mismatch: OnMismatch,
    bus: &EventBus,
) -> Result<(), EngineError> {
    match on_mismatch {
        OnMismatch::Error => {
            bus.publish(ReplicationEvent::SchemaSyncFailed {
                replicator: replicator_id.to_string(),
                table: table.to_string(),
                error: details.clone(),
                timestamp: Utc::now(),
            })
            .await;
            Err(EngineError::SchemaSync(format!("table {table}: {details}")))
        }
        OnMismatch::Warn => {
            warn!(table = %table, details = %details, "schema drift detected");
            Ok(())
        }
        OnMismatch::Ignore => Ok(()),
    }
}
