//! Sharded worker lanes preserving per-key operation order.
//!
//! Jobs with the same key always land on the same lane and run serially;
//! parallelism exists only across distinct keys.

use std::{
    collections::hash_map::DefaultHasher,
    future::Future,
    hash::{Hash, Hasher},
    pin::Pin,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

const LANE_MAILBOX: usize = 1024;

pub struct LanePool {
    senders: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl LanePool {
    pub fn new(lanes: usize) -> Self {
        let lanes = lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::channel::<Job>(LANE_MAILBOX);
            senders.push(tx);
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                debug!(lane, "worker lane drained");
            }));
        }

        LanePool { senders, handles }
    }

    fn lane_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Enqueues a job on the lane owning `key`. Backpressures when the
    /// lane mailbox is full; fails only once the pool is shut down.
    pub async fn dispatch<F>(&self, key: &str, job: F) -> Result<(), ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lane = self.lane_for(key);
        self.senders[lane]
            .send(Box::pin(job))
            .await
            .map_err(|_| ())
    }

    /// Closes the mailboxes and waits for every queued job to run.
    pub async fn drain(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Like [`LanePool::drain`], but aborts lanes still busy once the
    /// grace period elapses.
    pub async fn drain_with_grace(self, grace: std::time::Duration) {
        drop(self.senders);
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in self.handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                debug!("lane exceeded drain grace period, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn same_key_runs_in_dispatch_order() {
        let pool = LanePool::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50u32 {
            let seen = seen.clone();
            pool.dispatch("record-1", async move {
                // Yield to give out-of-order execution a chance to surface.
                tokio::task::yield_now().await;
                seen.lock().unwrap().push(i);
            })
            .await
            .unwrap();
        }
        pool.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distinct_keys_all_complete() {
        let pool = LanePool::new(4);
        let count = Arc::new(Mutex::new(0u32));

        for i in 0..100u32 {
            let count = count.clone();
            pool.dispatch(&format!("key-{i}"), async move {
                *count.lock().unwrap() += 1;
            })
            .await
            .unwrap();
        }
        pool.drain().await;

        assert_eq!(*count.lock().unwrap(), 100);
    }

    #[tokio::test]
    async fn drain_runs_queued_jobs_before_returning() {
        let pool = LanePool::new(1);
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        pool.dispatch("k", async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            *flag.lock().unwrap() = true;
        })
        .await
        .unwrap();

        pool.drain().await;
        assert!(*done.lock().unwrap());
    }
}
