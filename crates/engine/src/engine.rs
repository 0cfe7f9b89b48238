//! The replication engine: consumes source mutation events, fans out
//! across replicators, and drives each op through filter → transform →
//! driver with retries, batching, and per-key ordering.

use crate::{
    batch::{Batcher, FlushFn},
    bus::EventBus,
    config::PluginConfig,
    error::EngineError,
    lanes::LanePool,
    logstore::ReplicatorLog,
    mapping::Binding,
    metrics::Metrics,
    retry::RetryPolicy,
    schema_sync::TableLocks,
};
use chrono::{DateTime, Utc};
use drivers::{
    contract::{Driver, ReplicateOp},
    error::DriverError,
};
use model::{
    core::{
        outcome::{OpStatus, SkipReason},
        mutation::MutationEvent,
        operation::Operation,
        record::Record,
    },
    events::ReplicationEvent,
    log::LogEntry,
};
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker lanes for per-key ordering; keys shard by `hash(key) % LANES`.
const LANES: usize = 16;

/// One configured replicator, resolved and ready to run.
pub struct ReplicatorRuntime {
    pub id: String,
    pub driver: Arc<dyn Driver>,
    /// Source resource → canonical bindings.
    pub bindings: HashMap<String, Vec<Binding>>,
    pub enabled: AtomicBool,
    pub schema_opts: schema::plan::SyncOptions,
    pub table_locks: TableLocks,
}

impl ReplicatorRuntime {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct OpContext {
    runtime: Arc<ReplicatorRuntime>,
    resource: String,
    binding_index: usize,
    event: MutationEvent,
    first_seen: DateTime<Utc>,
}

impl OpContext {
    fn binding(&self) -> &Binding {
        &self.runtime.bindings[&self.resource][self.binding_index]
    }
}

struct PendingItem {
    ctx: OpContext,
    op: ReplicateOp,
}

enum Prepared {
    Op(ReplicateOp),
    Skip(SkipReason),
    Fail(String),
}

struct EngineInner {
    runtimes: Vec<Arc<ReplicatorRuntime>>,
    bus: EventBus,
    log: Arc<ReplicatorLog>,
    metrics: Metrics,
    retry: RetryPolicy,
    op_timeout: Duration,
    batch_size: usize,
    batch_timeout: Duration,
    stop_concurrency: usize,
    fanout: Semaphore,
    cancel: CancellationToken,
    lanes: Mutex<Option<LanePool>>,
    batchers: Mutex<HashMap<(String, String, usize), Batcher<PendingItem>>>,
}

pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationEngine {
    pub fn new(
        runtimes: Vec<Arc<ReplicatorRuntime>>,
        bus: EventBus,
        log: Arc<ReplicatorLog>,
        metrics: Metrics,
        config: &PluginConfig,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            runtimes,
            bus,
            log,
            metrics,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_backoff_ms),
            ),
            op_timeout: Duration::from_millis(config.timeout_ms),
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            stop_concurrency: config.stop_concurrency.max(1),
            fanout: Semaphore::new(config.replicator_concurrency.max(1)),
            cancel: CancellationToken::new(),
            lanes: Mutex::new(Some(LanePool::new(LANES))),
            batchers: Mutex::new(HashMap::new()),
        });
        ReplicationEngine {
            inner,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn runtimes(&self) -> &[Arc<ReplicatorRuntime>] {
        &self.inner.runtimes
    }

    pub fn runtime(&self, id: &str) -> Option<Arc<ReplicatorRuntime>> {
        self.inner.runtimes.iter().find(|rt| rt.id == id).cloned()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Subscribes the engine to the source mutation channel.
    pub async fn start(&self, mut events: mpsc::UnboundedReceiver<MutationEvent>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => dispatch_event(&inner, event).await,
                        None => break,
                    },
                }
            }
            debug!("engine dispatcher stopped");
        });
        *self.dispatcher.lock().await = Some(handle);
        info!(replicators = self.inner.runtimes.len(), "replication engine started");
    }

    /// Stops accepting events, drains in-flight work within the grace
    /// period, cancels what remains, and closes every driver.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }

        let batchers: Vec<Batcher<PendingItem>> = {
            let mut map = self.inner.batchers.lock().await;
            map.drain().map(|(_, b)| b).collect()
        };
        for batcher in batchers {
            batcher.close().await;
        }

        if let Some(lanes) = self.inner.lanes.lock().await.take() {
            lanes.drain_with_grace(self.inner.op_timeout).await;
        }

        let close_permits = Arc::new(Semaphore::new(self.inner.stop_concurrency));
        let mut closers = Vec::new();
        for runtime in &self.inner.runtimes {
            let runtime = runtime.clone();
            let permits = close_permits.clone();
            let bus = self.inner.bus.clone();
            closers.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.expect("stop semaphore closed");
                if let Err(e) = runtime.driver.close().await {
                    warn!(replicator = %runtime.id, error = %e, "driver close failed");
                    bus.publish(ReplicationEvent::ReplicatorCleanupError {
                        replicator: runtime.id.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                }
            }));
        }
        for closer in closers {
            let _ = closer.await;
        }

        info!("replication engine stopped");
    }

    /// Replays one event through a single replicator and waits for every
    /// matching binding to reach a terminal outcome. Used by manual sync.
    pub async fn process_direct(
        &self,
        runtime: &Arc<ReplicatorRuntime>,
        event: MutationEvent,
    ) -> Result<(), EngineError> {
        let Some(bindings) = runtime.bindings.get(&event.resource) else {
            return Ok(());
        };
        for (index, binding) in bindings.iter().enumerate() {
            if binding.is_inert() || !binding.actions.contains(event.operation) {
                continue;
            }
            let ctx = OpContext {
                runtime: runtime.clone(),
                resource: event.resource.clone(),
                binding_index: index,
                event: event.clone(),
                first_seen: Utc::now(),
            };
            match prepare(&ctx) {
                Prepared::Skip(reason) => {
                    finish(&self.inner, &ctx, OpStatus::Skipped, 0, None, Some(reason)).await;
                }
                Prepared::Fail(message) => {
                    finish(&self.inner, &ctx, OpStatus::Failed, 0, Some(message), None).await;
                }
                Prepared::Op(op) => {
                    attempt_loop(self.inner.clone(), ctx, op, 1).await;
                }
            }
        }
        Ok(())
    }
}

async fn dispatch_event(inner: &Arc<EngineInner>, event: MutationEvent) {
    for runtime in &inner.runtimes {
        if !runtime.is_enabled() {
            continue;
        }
        let Some(bindings) = runtime.bindings.get(&event.resource) else {
            continue;
        };

        for (index, binding) in bindings.iter().enumerate() {
            if binding.is_inert() || !binding.actions.contains(event.operation) {
                continue;
            }

            let ctx = OpContext {
                runtime: runtime.clone(),
                resource: event.resource.clone(),
                binding_index: index,
                event: event.clone(),
                first_seen: Utc::now(),
            };

            if runtime.driver.supports_batch() && inner.batch_size > 1 {
                // Filter and transform up front so short-circuits never
                // occupy buffer space.
                match prepare(&ctx) {
                    Prepared::Skip(reason) => {
                        finish(inner, &ctx, OpStatus::Skipped, 0, None, Some(reason)).await;
                    }
                    Prepared::Fail(message) => {
                        finish(inner, &ctx, OpStatus::Failed, 0, Some(message), None).await;
                    }
                    Prepared::Op(op) => {
                        let sender = batcher_sender(inner, &ctx).await;
                        if sender.send(PendingItem { ctx: ctx.clone(), op }).await.is_err() {
                            finish(inner, &ctx, OpStatus::Cancelled, 0, None, None).await;
                        }
                    }
                }
            } else {
                let key = format!(
                    "{}/{}/{}",
                    runtime.id,
                    binding.destination,
                    event.record_id
                );
                let job_inner = inner.clone();
                let job_ctx = ctx.clone();
                let dispatched = {
                    let lanes = inner.lanes.lock().await;
                    match lanes.as_ref() {
                        Some(lanes) => {
                            lanes
                                .dispatch(&key, async move {
                                    process_single(job_inner, job_ctx).await;
                                })
                                .await
                        }
                        None => Err(()),
                    }
                };
                if dispatched.is_err() {
                    finish(inner, &ctx, OpStatus::Cancelled, 0, None, None).await;
                }
            }
        }
    }
}

async fn batcher_sender(inner: &Arc<EngineInner>, ctx: &OpContext) -> mpsc::Sender<PendingItem> {
    let key = (
        ctx.runtime.id.clone(),
        ctx.resource.clone(),
        ctx.binding_index,
    );
    let mut batchers = inner.batchers.lock().await;
    batchers
        .entry(key)
        .or_insert_with(|| {
            let weak = Arc::downgrade(inner);
            let flush: FlushFn<PendingItem> = Arc::new(move |items| {
                let weak: Weak<EngineInner> = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        flush_batch(inner, items).await;
                    }
                })
            });
            Batcher::spawn(inner.batch_size, inner.batch_timeout, flush)
        })
        .sender()
}

async fn process_single(inner: Arc<EngineInner>, ctx: OpContext) {
    match prepare(&ctx) {
        Prepared::Skip(reason) => {
            finish(&inner, &ctx, OpStatus::Skipped, 0, None, Some(reason)).await;
        }
        Prepared::Fail(message) => {
            finish(&inner, &ctx, OpStatus::Failed, 0, Some(message), None).await;
        }
        Prepared::Op(op) => {
            attempt_loop(inner, ctx, op, 1).await;
        }
    }
}

/// Runs the user filter and transform inside a panic guard; a panicking
/// closure becomes a per-op permanent failure, never an engine crash.
fn prepare(ctx: &OpContext) -> Prepared {
    let binding = ctx.binding();
    let operation = ctx.event.operation;
    let payload: Record = ctx
        .event
        .after
        .clone()
        .or_else(|| ctx.event.before.clone())
        .unwrap_or_default();

    if let Some(predicate) = &binding.should_replicate {
        match catch_unwind(AssertUnwindSafe(|| predicate(&payload, operation))) {
            Ok(true) => {}
            Ok(false) => return Prepared::Skip(SkipReason::Filtered),
            Err(_) => return Prepared::Fail("should_replicate predicate panicked".to_string()),
        }
    }

    let transformed = match &binding.transform {
        None => Some(payload),
        Some(transform) => match catch_unwind(AssertUnwindSafe(|| transform(&payload, operation))) {
            Ok(result) => result,
            Err(_) => return Prepared::Fail("transform panicked".to_string()),
        },
    };

    let Some(transformed) = transformed else {
        return Prepared::Skip(SkipReason::TransformedAway);
    };

    Prepared::Op(ReplicateOp {
        resource: ctx.resource.clone(),
        operation,
        record_id: ctx.event.record_id.clone(),
        record: match operation {
            Operation::Deleted => None,
            _ => Some(transformed),
        },
        before: ctx.event.before.clone(),
        timestamp: ctx.event.timestamp,
    })
}

/// Drives one op to a terminal outcome, retrying transient failures with
/// backoff. `attempt_no` is 1-based and never exceeds `max_retries + 1`.
async fn attempt_loop(
    inner: Arc<EngineInner>,
    ctx: OpContext,
    op: ReplicateOp,
    mut attempt_no: u32,
) {
    let destination = ctx.binding().destination.clone();

    loop {
        if inner.cancel.is_cancelled() {
            finish(
                &inner,
                &ctx,
                OpStatus::Cancelled,
                attempt_no.saturating_sub(1),
                None,
                None,
            )
            .await;
            return;
        }

        let result = {
            let _permit = inner.fanout.acquire().await.expect("fanout semaphore closed");
            let lock = ctx.runtime.table_locks.for_table(&destination).await;
            let _guard = lock.read().await;
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                inner.op_timeout,
                ctx.runtime.driver.replicate(&destination, &op),
            )
            .await;
            (started.elapsed(), outcome)
        };

        let (elapsed, outcome) = result;
        let outcome = match outcome {
            Ok(r) => r,
            Err(_) => Err(DriverError::timeout(format!(
                "attempt exceeded {}ms",
                inner.op_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(()) => {
                inner
                    .bus
                    .publish(ReplicationEvent::Replicated {
                        replicator: ctx.runtime.id.clone(),
                        resource: ctx.resource.clone(),
                        record_id: ctx.event.record_id.clone(),
                        operation: ctx.event.operation,
                        duration_ms: elapsed.as_millis() as u64,
                        timestamp: Utc::now(),
                    })
                    .await;
                finish(&inner, &ctx, OpStatus::Success, attempt_no, None, None).await;
                return;
            }
            Err(err) => {
                let retriable = err.is_retriable();
                inner
                    .bus
                    .publish(ReplicationEvent::ReplicatorError {
                        replicator: ctx.runtime.id.clone(),
                        resource: ctx.resource.clone(),
                        record_id: ctx.event.record_id.clone(),
                        operation: ctx.event.operation,
                        error: err.to_string(),
                        attempt_no,
                        retriable,
                        timestamp: Utc::now(),
                    })
                    .await;

                if retriable && inner.retry.should_retry(attempt_no) {
                    let delay = inner.retry.delay_for(
                        attempt_no,
                        err.retry_after,
                        ctx.runtime.driver.retry_delay(attempt_no),
                    );
                    inner.metrics.increment_retries();
                    debug!(
                        replicator = %ctx.runtime.id,
                        record_id = %ctx.event.record_id,
                        attempt_no,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling retry"
                    );
                    tokio::select! {
                        _ = inner.cancel.cancelled() => {
                            finish(&inner, &ctx, OpStatus::Cancelled, attempt_no, None, None).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt_no += 1;
                } else {
                    fail_terminally(&inner, &ctx, &op, attempt_no, err).await;
                    return;
                }
            }
        }
    }
}

async fn fail_terminally(
    inner: &Arc<EngineInner>,
    ctx: &OpContext,
    op: &ReplicateOp,
    attempts: u32,
    err: DriverError,
) {
    let mut entry = LogEntry::new(
        &ctx.runtime.id,
        &ctx.resource,
        &ctx.event.record_id,
        ctx.event.operation,
        OpStatus::Failed,
    );
    entry.attempts = attempts;
    entry.first_seen_at = ctx.first_seen;
    entry.last_error = Some(err.to_string());

    let dead_lettered = inner
        .log
        .dead_letter(&entry, op.record.as_ref(), op.before.as_ref())
        .await;
    let status = if dead_lettered {
        OpStatus::DeadLettered
    } else {
        OpStatus::Failed
    };
    finish(inner, ctx, status, attempts, Some(err.to_string()), None).await;
}

async fn finish(
    inner: &Arc<EngineInner>,
    ctx: &OpContext,
    status: OpStatus,
    attempts: u32,
    last_error: Option<String>,
    skip_reason: Option<SkipReason>,
) {
    match status {
        OpStatus::Success => inner.metrics.increment_replicated(),
        OpStatus::Failed | OpStatus::DeadLettered => inner.metrics.increment_failed(),
        OpStatus::Skipped => inner.metrics.increment_skipped(),
        OpStatus::Cancelled => inner.metrics.increment_cancelled(),
    }

    let mut entry = LogEntry::new(
        &ctx.runtime.id,
        &ctx.resource,
        &ctx.event.record_id,
        ctx.event.operation,
        status,
    );
    entry.attempts = attempts;
    entry.first_seen_at = ctx.first_seen;
    entry.last_attempt_at = Utc::now();
    entry.last_error = last_error;
    entry.skip_reason = skip_reason;
    if matches!(status, OpStatus::Failed | OpStatus::DeadLettered) {
        entry.payload_snapshot = ctx.event.after.clone();
    }

    inner.log.record(entry).await;
}

/// Flushes a buffered batch. A retriable batch failure falls back to
/// per-item replay; each item retains its own remaining retry count.
async fn flush_batch(inner: Arc<EngineInner>, items: Vec<PendingItem>) {
    if items.is_empty() {
        return;
    }

    if inner.cancel.is_cancelled() {
        for item in &items {
            finish(&inner, &item.ctx, OpStatus::Cancelled, 0, None, None).await;
        }
        return;
    }

    let ctx0 = &items[0].ctx;
    let destination = ctx0.binding().destination.clone();
    let runtime = ctx0.runtime.clone();
    let ops: Vec<ReplicateOp> = items.iter().map(|item| item.op.clone()).collect();

    let (elapsed, outcome) = {
        let _permit = inner.fanout.acquire().await.expect("fanout semaphore closed");
        let lock = runtime.table_locks.for_table(&destination).await;
        let _guard = lock.read().await;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            inner.op_timeout,
            runtime.driver.replicate_batch(&destination, &ops),
        )
        .await;
        (started.elapsed(), outcome)
    };

    let results = match outcome {
        Ok(results) => results,
        Err(_) => {
            let err = DriverError::timeout(format!(
                "batch attempt exceeded {}ms",
                inner.op_timeout.as_millis()
            ));
            items.iter().map(|_| Err(err.clone())).collect()
        }
    };

    for (item, result) in items.into_iter().zip(results) {
        match result {
            Ok(()) => {
                inner
                    .bus
                    .publish(ReplicationEvent::Replicated {
                        replicator: item.ctx.runtime.id.clone(),
                        resource: item.ctx.resource.clone(),
                        record_id: item.ctx.event.record_id.clone(),
                        operation: item.ctx.event.operation,
                        duration_ms: elapsed.as_millis() as u64,
                        timestamp: Utc::now(),
                    })
                    .await;
                finish(&inner, &item.ctx, OpStatus::Success, 1, None, None).await;
            }
            Err(err) => {
                inner
                    .bus
                    .publish(ReplicationEvent::ReplicatorError {
                        replicator: item.ctx.runtime.id.clone(),
                        resource: item.ctx.resource.clone(),
                        record_id: item.ctx.event.record_id.clone(),
                        operation: item.ctx.event.operation,
                        error: err.to_string(),
                        attempt_no: 1,
                        retriable: err.is_retriable(),
                        timestamp: Utc::now(),
                    })
                    .await;
                if err.is_retriable() && inner.retry.should_retry(1) {
                    // The batch call was attempt one; replay serially so
                    // per-record order survives the fallback.
                    attempt_loop(inner.clone(), item.ctx, item.op, 2).await;
                } else {
                    fail_terminally(&inner, &item.ctx, &item.op, 1, err).await;
                }
            }
        }
    }
}
