//! Background persistence worker.
//!
//! Producers call [`PersistenceWorker::schedule`] from the trading paths; it
//! only touches the in-memory queue. A single consumer task pops batches in
//! submission order and applies them to the store on the blocking pool.
//!
//! # Lifecycle
//!
//! ```text
//! new() → start() → schedule()* → stop(Drain | Discard)
//! ```
//!
//! `stop` closes the queue, then either applies everything still queued
//! (`Drain`) or drops it with a log line (`Discard`), and waits for the
//! consumer to exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lotbot_telemetry::Metrics;

use crate::error::{PersistenceError, PersistenceResult};
use crate::mutation::Mutation;
use crate::queue::{MutationQueue, ScheduleOutcome, Task};
use crate::store::StateStore;

/// What `stop` does with queued mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    #[default]
    Drain,
    Discard,
}

/// Independent logging toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Log every scheduled mutation.
    #[serde(default)]
    pub log_schedule: bool,
    /// Log every applied batch.
    #[serde(default)]
    pub log_completion: bool,
}

fn default_data_dir() -> String {
    "data/state".to_string()
}

fn default_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    64
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Journal directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Queue capacity before eviction starts.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum mutations applied per blocking call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub log: LogOptions,
    #[serde(default)]
    pub stop_policy: StopPolicy,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capacity: default_capacity(),
            batch_size: default_batch_size(),
            log: LogOptions::default(),
            stop_policy: StopPolicy::default(),
        }
    }
}

/// Worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistStats {
    pub scheduled: u64,
    pub applied: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub failed: u64,
    pub discarded: u64,
    pub depth: usize,
}

/// Result of [`PersistenceWorker::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub policy: StopPolicy,
    pub discarded: usize,
    pub stats: PersistStats,
}

#[derive(Debug, Default)]
struct LogFlags {
    schedule: AtomicBool,
    completion: AtomicBool,
}

#[derive(Debug, Default)]
struct Progress {
    applied: AtomicU64,
    failed: AtomicU64,
}

/// Shared state handed to the consumer task.
#[derive(Clone)]
struct Consumer {
    queue: Arc<MutationQueue>,
    store: Arc<dyn StateStore>,
    batch_size: usize,
    log: Arc<LogFlags>,
    progress: Arc<Progress>,
}

impl Consumer {
    async fn run(self) {
        debug!(store = self.store.name(), "Persistence consumer started");
        loop {
            let Some(batch) = self.queue.pop_batch(self.batch_size) else {
                break;
            };
            if batch.is_empty() {
                self.queue.notified().await;
                continue;
            }

            let count = batch.len();
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || apply_batch(store.as_ref(), batch)).await {
                Ok((applied, failed, last_seq)) => {
                    self.progress.applied.fetch_add(applied, Ordering::Relaxed);
                    self.progress.failed.fetch_add(failed, Ordering::Relaxed);
                    Metrics::persist_tasks("applied", applied as usize);
                    Metrics::persist_tasks("failed", failed as usize);
                    if self.log.completion.load(Ordering::Relaxed) {
                        debug!(applied, failed, last_seq, "Persistence batch applied");
                    }
                }
                Err(e) => {
                    self.progress.failed.fetch_add(count as u64, Ordering::Relaxed);
                    Metrics::persist_tasks("failed", count);
                    error!(error = %e, count, "Persistence batch panicked");
                }
            }
        }
        debug!("Persistence consumer stopped");
    }
}

/// Apply a batch in order. Returns (applied, failed, last seq).
fn apply_batch(store: &dyn StateStore, batch: Vec<Task>) -> (u64, u64, u64) {
    let mut applied = 0;
    let mut failed = 0;
    let mut last_seq = 0;
    for task in batch {
        last_seq = task.seq;
        match store.upsert(&task.mutation) {
            Ok(()) => applied += 1,
            Err(e) => {
                failed += 1;
                warn!(
                    key = %task.mutation.key,
                    reason = ?task.mutation.reason,
                    seq = task.seq,
                    error = %e,
                    "Persistence upsert failed"
                );
            }
        }
    }
    if let Err(e) = store.flush() {
        warn!(error = %e, store = store.name(), "Persistence flush failed");
    }
    (applied, failed, last_seq)
}

/// Asynchronous persistence worker.
pub struct PersistenceWorker {
    consumer: Consumer,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWorker {
    pub fn new(config: &PersistenceConfig, store: Arc<dyn StateStore>) -> Self {
        let worker = Self {
            consumer: Consumer {
                queue: Arc::new(MutationQueue::new(config.capacity)),
                store,
                batch_size: config.batch_size.max(1),
                log: Arc::new(LogFlags::default()),
                progress: Arc::new(Progress::default()),
            },
            handle: Mutex::new(None),
        };
        worker.set_log_options(config.log);
        worker
    }

    /// Spawn the consumer task. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("Persistence worker already started");
            return;
        }
        info!(
            store = self.consumer.store.name(),
            capacity = self.consumer.queue.capacity(),
            batch_size = self.consumer.batch_size,
            "Persistence worker started"
        );
        *handle = Some(tokio::spawn(self.consumer.clone().run()));
    }

    /// Schedule a mutation. Never blocks.
    pub fn schedule(&self, mutation: Mutation) -> ScheduleOutcome {
        let log = self
            .consumer
            .log
            .schedule
            .load(Ordering::Relaxed)
            .then(|| (mutation.key.clone(), mutation.reason));
        let outcome = self.consumer.queue.schedule(mutation);
        if let Some((key, reason)) = log {
            debug!(key = %key, reason = ?reason, outcome = ?outcome, "Mutation scheduled");
        }
        outcome
    }

    pub fn set_log_options(&self, options: LogOptions) {
        self.consumer
            .log
            .schedule
            .store(options.log_schedule, Ordering::Relaxed);
        self.consumer
            .log
            .completion
            .store(options.log_completion, Ordering::Relaxed);
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_schedule: self.consumer.log.schedule.load(Ordering::Relaxed),
            log_completion: self.consumer.log.completion.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> PersistStats {
        let counters = &self.consumer.queue.counters;
        PersistStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            applied: self.consumer.progress.applied.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            failed: self.consumer.progress.failed.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            depth: self.consumer.queue.depth(),
        }
    }

    /// Stop the worker.
    ///
    /// When the worker was never started, `Drain` applies the queue inline.
    pub async fn stop(&self, policy: StopPolicy) -> PersistenceResult<StopReport> {
        let discarded = match policy {
            StopPolicy::Drain => 0,
            StopPolicy::Discard => {
                let n = self.consumer.queue.discard_all();
                if n > 0 {
                    warn!(discarded = n, "Discarding queued mutations on stop");
                }
                n
            }
        };
        self.consumer.queue.close();

        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PersistenceError::Worker(e.to_string()))?,
            None => self.consumer.clone().run().await,
        }

        let stats = self.stats();
        info!(
            policy = ?policy,
            applied = stats.applied,
            failed = stats.failed,
            evicted = stats.evicted,
            rejected = stats.rejected,
            discarded,
            "Persistence worker stopped"
        );
        Ok(StopReport {
            policy,
            discarded,
            stats,
        })
    }
}
