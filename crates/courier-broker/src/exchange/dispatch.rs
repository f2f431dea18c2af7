//! Dispatch worker pool.
//!
//! A fixed set of long-lived workers drains a lock-free queue of
//! destination keys and pushes ready messages to consumers. Each
//! worker has its own wake handle; posting an event wakes every worker
//! because any of them may service the queue. Wake-ups coalesce: many
//! posts between drains cost one effective wake per worker, and a
//! 1-second bounded idle wait backstops any missed signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::destination::Destination;

/// Shared destination registry, read-locked by dispatch.
pub(crate) type Registry = Arc<RwLock<HashMap<String, Arc<Destination>>>>;

/// Upper bound on how long an idle worker sleeps before re-sweeping.
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct DispatchPool {
    events: Arc<SegQueue<String>>,
    wakeups: Arc<Vec<Notify>>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let wakeups = (0..workers).map(|_| Notify::new()).collect();
        Self {
            events: Arc::new(SegQueue::new()),
            wakeups: Arc::new(wakeups),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueue a destination key (if any) and wake every worker.
    pub fn post(&self, key: Option<String>) {
        if let Some(key) = key {
            self.events.push(key);
        }
        for notify in self.wakeups.iter() {
            notify.notify_one();
        }
    }

    /// Spawn the workers. Calling start on a running pool is a no-op.
    pub async fn start(&self, registry: Registry) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = self.handles.lock().await;
        for worker in 0..self.wakeups.len() {
            let registry = registry.clone();
            let events = self.events.clone();
            let wakeups = self.wakeups.clone();
            let running = self.running.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, registry, events, wakeups, running).await;
            }));
        }
        tracing::info!(workers = self.wakeups.len(), "dispatch pool started");
    }

    /// Clear the running flag, wake every worker, and wait for all of
    /// them to exit. Idempotent and safe to call when not running.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for notify in self.wakeups.iter() {
            notify.notify_one();
        }
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "dispatch worker join failed");
            }
        }
        tracing::info!("dispatch pool stopped");
    }
}

/// Two-phase worker loop: a targeted drain of posted keys keeps hot
/// destinations low-latency, and a full sweep restores liveness when a
/// post was lost or selector state changed. The bounded idle wait is
/// the correctness backstop for both.
async fn worker_loop(
    worker: usize,
    registry: Registry,
    events: Arc<SegQueue<String>>,
    wakeups: Arc<Vec<Notify>>,
    running: Arc<AtomicBool>,
) {
    tracing::debug!(worker, "dispatch worker running");
    while running.load(Ordering::Acquire) {
        loop {
            {
                let reg = registry.read().await;
                while let Some(key) = events.pop() {
                    if let Some(dest) = reg.get(&key) {
                        dest.get_next_message_for_all_subscriptions().await;
                    }
                }
            }

            let mut progressed = false;
            {
                let reg = registry.read().await;
                for dest in reg.values() {
                    if dest.get_next_message_for_all_subscriptions().await {
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let _ = tokio::time::timeout(IDLE_WAIT, wakeups[worker].notified()).await;
    }
    tracing::debug!(worker, "dispatch worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pool = DispatchPool::new(2);
        pool.stop().await;
        assert!(!pool.is_running());

        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        pool.start(registry.clone()).await;
        assert!(pool.is_running());
        pool.start(registry).await;

        pool.stop().await;
        assert!(!pool.is_running());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_post_without_workers_accumulates_events() {
        let pool = DispatchPool::new(1);
        pool.post(Some("queue/q1".to_string()));
        pool.post(None);
        assert_eq!(pool.events.pop().as_deref(), Some("queue/q1"));
        assert!(pool.events.pop().is_none());
    }
}
