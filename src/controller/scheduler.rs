//! Keyed work queue
//!
//! At most one reconcile runs per record key. Requests for a key that is
//! already running are coalesced into a single follow-up run; distinct keys
//! run in parallel up to the configured worker limit.
//!
//! ```text
//! enqueue(k) ──► vacant? ──yes──► spawn worker(k) ──► reconcile ──► dirty? ──yes──► run again
//!                  │                                                  │
//!                  no ──► mark dirty                                   no ──► release k
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::cluster::{reconcile_key, Context};
use super::Action;
use crate::Result;

#[derive(Debug, Default)]
struct KeyState {
    dirty: bool,
}

struct Inner {
    ctx: Arc<Context>,
    running: DashMap<String, KeyState>,
    timers: DashMap<String, u64>,
    timer_seq: AtomicU64,
    permits: Semaphore,
    tracker: TaskTracker,
    idle: Notify,
}

/// Runs reconciles with per-key mutual exclusion
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler running at most `config.workers` reconciles at once
    pub fn new(ctx: Arc<Context>) -> Self {
        let workers = ctx.config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                ctx,
                running: DashMap::new(),
                timers: DashMap::new(),
                timer_seq: AtomicU64::new(0),
                permits: Semaphore::new(workers),
                tracker: TaskTracker::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Shared controller context
    pub fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    /// Request a reconcile of `key`
    ///
    /// Supersedes any pending requeue timer for the key.
    pub fn enqueue(&self, key: &str) {
        if self.cancel().is_cancelled() {
            debug!(cluster = %key, "shutting down, dropping reconcile request");
            return;
        }
        self.inner.timers.remove(key);

        match self.inner.running.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                debug!(cluster = %key, "reconcile in flight, coalescing request");
                entry.get_mut().dirty = true;
            }
            Entry::Vacant(entry) => {
                entry.insert(KeyState::default());
                let this = self.clone();
                let key = key.to_string();
                self.inner.tracker.spawn(async move { this.work(key).await });
            }
        }
    }

    /// Reconcile every record currently in the store
    pub async fn enqueue_all(&self) -> Result<usize> {
        let clusters = self.inner.ctx.specs.list_clusters().await?;
        for cluster in &clusters {
            self.enqueue(&cluster.key());
        }
        Ok(clusters.len())
    }

    /// Number of keys with a reconcile running or queued
    pub fn in_flight(&self) -> usize {
        self.inner.running.len()
    }

    /// Number of keys waiting on a requeue timer
    pub fn scheduled(&self) -> usize {
        self.inner.timers.len()
    }

    /// Wait until no reconcile is running
    ///
    /// Requeue timers may still be pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.running.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no reconcile is running and no requeue timer is pending
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.running.is_empty() && self.inner.timers.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, let running reconciles reach a checkpoint and
    /// wait for them
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "scheduler shutting down");
        self.cancel().cancel();
        self.inner.timers.clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.idle.notify_waiters();
    }

    fn cancel(&self) -> &CancellationToken {
        &self.inner.ctx.cancel
    }

    async fn work(self, key: String) {
        loop {
            let action = {
                let Ok(_permit) = self.inner.permits.acquire().await else {
                    warn!(cluster = %key, "worker pool closed");
                    break;
                };
                reconcile_key(&key, self.inner.ctx.clone()).await
            };

            if self.take_dirty_or_release(&key) {
                continue;
            }
            if let Action::Requeue(delay) = action {
                self.schedule(&key, delay);
            }
            break;
        }
        self.inner.idle.notify_waiters();
    }

    /// Rerun if another request arrived meanwhile, otherwise release the key
    fn take_dirty_or_release(&self, key: &str) -> bool {
        match self.inner.running.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().dirty => {
                entry.get_mut().dirty = false;
                true
            }
            Entry::Occupied(entry) => {
                entry.remove();
                false
            }
            Entry::Vacant(_) => false,
        }
    }

    fn schedule(&self, key: &str, delay: Duration) {
        if self.cancel().is_cancelled() {
            return;
        }
        let seq = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.timers.insert(key.to_string(), seq);
        debug!(cluster = %key, delay_ms = delay.as_millis(), "requeue scheduled");

        let this = self.clone();
        let key = key.to_string();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = this.cancel().cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // A newer enqueue or timer for the key supersedes this one.
                    let current = this
                        .inner
                        .timers
                        .remove_if(&key, |_, s| *s == seq)
                        .is_some();
                    if current {
                        this.enqueue(&key);
                    }
                }
            }
            this.inner.idle.notify_waiters();
        });
    }
}
