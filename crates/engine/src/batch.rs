//! Size- and time-triggered batching for batch-capable drivers.
//!
//! One batcher per (replicator, binding): items flush when the buffer
//! reaches the configured size or when the oldest queued item has waited
//! the batch timeout, whichever comes first. Flushes run serially inside
//! the batcher task, preserving per-binding order.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::debug;

pub type FlushFn<T> =
    Arc<dyn Fn(Vec<T>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct Batcher<T> {
    tx: mpsc::Sender<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn spawn(batch_size: usize, timeout: Duration, flush: FlushFn<T>) -> Self {
        let batch_size = batch_size.max(1);
        let capacity = (batch_size * 2).max(16);
        let (tx, mut rx) = mpsc::channel::<T>(capacity);

        let handle = tokio::spawn(async move {
            let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
            let mut deadline: Option<Instant> = None;

            loop {
                let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => {
                            if buffer.is_empty() {
                                deadline = Some(Instant::now() + timeout);
                            }
                            buffer.push(item);
                            if buffer.len() >= batch_size {
                                flush(std::mem::take(&mut buffer)).await;
                                deadline = None;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush(std::mem::take(&mut buffer)).await;
                            }
                            break;
                        }
                    },
                    _ = sleep_until(wake_at), if deadline.is_some() => {
                        flush(std::mem::take(&mut buffer)).await;
                        deadline = None;
                    }
                }
            }
            debug!("batcher drained");
        });

        Batcher { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<T> {
        self.tx.clone()
    }

    /// Flushes whatever is buffered and waits for the task to exit.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}
