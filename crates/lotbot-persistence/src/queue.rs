//! Bounded, non-blocking mutation queue.
//!
//! Consumption is global FIFO, so mutations for one key are applied in the
//! order they were scheduled. When the queue is full:
//! - the oldest Low task is evicted to make room, for any incoming task
//! - a Normal task with no Low to evict may evict the oldest Normal
//! - a High task is never dropped and may push the queue over capacity
//! - anything else is rejected

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use lotbot_telemetry::Metrics;

use crate::mutation::{Mutation, Priority};

/// Result of [`MutationQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Queued,
    /// Queued after evicting the oldest task of `priority`.
    Evicted { priority: Priority },
    /// High-priority task queued beyond capacity.
    Overflow,
    /// No room and nothing evictable; the mutation was dropped.
    Rejected,
    /// The worker is stopped; the mutation was dropped.
    Closed,
}

impl ScheduleOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::Evicted { .. } | Self::Overflow)
    }
}

#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) seq: u64,
    pub(crate) priority: Priority,
    pub(crate) mutation: Mutation,
}

/// Counters kept by the queue.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub(crate) scheduled: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) discarded: AtomicU64,
}

/// Bounded priority-aware FIFO shared by producers and the consumer.
#[derive(Debug)]
pub struct MutationQueue {
    capacity: usize,
    tasks: Mutex<VecDeque<Task>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
    pub(crate) counters: QueueCounters,
}

impl MutationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tasks: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue without blocking.
    ///
    /// The closed flag is read under the task lock, so a mutation is either
    /// queued before [`MutationQueue::close`] takes effect (and reaches the
    /// consumer's final drain) or refused with [`ScheduleOutcome::Closed`].
    pub fn schedule(&self, mutation: Mutation) -> ScheduleOutcome {
        let priority = mutation.priority();
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            drop(tasks);
            warn!(key = %mutation.key, reason = ?mutation.reason, "Mutation dropped, queue closed");
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            Metrics::persist_task("rejected");
            return ScheduleOutcome::Closed;
        }

        let outcome = if tasks.len() < self.capacity {
            ScheduleOutcome::Queued
        } else if let Some(evicted) = evict_oldest(&mut tasks, Priority::Low) {
            ScheduleOutcome::Evicted { priority: evicted }
        } else if priority == Priority::Normal {
            match evict_oldest(&mut tasks, Priority::Normal) {
                Some(evicted) => ScheduleOutcome::Evicted { priority: evicted },
                None => ScheduleOutcome::Rejected,
            }
        } else if priority == Priority::High {
            ScheduleOutcome::Overflow
        } else {
            ScheduleOutcome::Rejected
        };

        match outcome {
            ScheduleOutcome::Rejected => {
                drop(tasks);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Metrics::persist_task("rejected");
                debug!(key = %mutation.key, priority = %priority, "Mutation rejected, queue full");
                return outcome;
            }
            ScheduleOutcome::Evicted { priority: evicted } => {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                Metrics::persist_evicted(evicted.as_str());
            }
            ScheduleOutcome::Overflow => {
                warn!(
                    key = %mutation.key,
                    reason = ?mutation.reason,
                    depth = tasks.len() + 1,
                    capacity = self.capacity,
                    "High-priority mutation queued over capacity"
                );
            }
            _ => {}
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tasks.push_back(Task {
            seq,
            priority,
            mutation,
        });
        let depth = tasks.len();
        drop(tasks);

        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        Metrics::persist_queue_depth(depth);
        self.notify.notify_one();
        outcome
    }

    /// Take up to `max` tasks from the front.
    ///
    /// Returns `None` once the queue is closed and empty; nothing can be
    /// queued after that.
    pub(crate) fn pop_batch(&self, max: usize) -> Option<Vec<Task>> {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() && self.is_closed() {
            return None;
        }
        let n = max.max(1).min(tasks.len());
        let batch: Vec<Task> = tasks.drain(..n).collect();
        Metrics::persist_queue_depth(tasks.len());
        Some(batch)
    }

    /// Drop everything still queued. Returns the number of dropped tasks.
    pub(crate) fn discard_all(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let n = tasks.len();
        tasks.clear();
        drop(tasks);
        self.counters.discarded.fetch_add(n as u64, Ordering::Relaxed);
        Metrics::persist_tasks("discarded", n);
        Metrics::persist_queue_depth(0);
        n
    }

    /// Refuse further scheduling and wake the consumer.
    pub(crate) fn close(&self) {
        let tasks = self.tasks.lock();
        self.closed.store(true, Ordering::Release);
        drop(tasks);
        self.notify.notify_one();
    }

    /// Wait for a schedule or close signal.
    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Remove the oldest task of `priority`; returns the priority on success.
fn evict_oldest(tasks: &mut VecDeque<Task>, priority: Priority) -> Option<Priority> {
    let idx = tasks.iter().position(|t| t.priority == priority)?;
    let evicted = tasks.remove(idx)?;
    debug!(
        key = %evicted.mutation.key,
        seq = evicted.seq,
        priority = %priority,
        "Evicted queued mutation"
    );
    Some(priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationReason;
    use lotbot_core::PositionId;

    fn mutation(id: u64, reason: MutationReason) -> Mutation {
        Mutation::risk(PositionId(id), None, reason)
    }

    #[test]
    fn test_fifo_order() {
        let q = MutationQueue::new(10);
        for i in 0..3 {
            assert_eq!(q.schedule(mutation(i, MutationReason::PeakUpdate)), ScheduleOutcome::Queued);
        }
        let batch = q.pop_batch(10).unwrap();
        let keys: Vec<_> = batch.iter().map(|t| t.mutation.key.as_str()).collect();
        assert_eq!(keys, vec!["R0", "R1", "R2"]);
        assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_low_evicts_oldest_low() {
        let q = MutationQueue::new(2);
        q.schedule(mutation(1, MutationReason::PeakUpdate));
        q.schedule(mutation(2, MutationReason::PeakUpdate));
        assert_eq!(
            q.schedule(mutation(3, MutationReason::PeakUpdate)),
            ScheduleOutcome::Evicted {
                priority: Priority::Low
            }
        );
        let keys: Vec<_> = q.pop_batch(10).unwrap().into_iter().map(|t| t.mutation.key).collect();
        assert_eq!(keys, vec!["R2", "R3"]);
    }

    #[test]
    fn test_low_rejected_when_no_low_queued() {
        let q = MutationQueue::new(1);
        q.schedule(mutation(1, MutationReason::StopLossUpdate));
        assert_eq!(
            q.schedule(mutation(2, MutationReason::PeakUpdate)),
            ScheduleOutcome::Rejected
        );
        assert_eq!(q.counters.rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_normal_may_evict_normal() {
        let q = MutationQueue::new(1);
        q.schedule(mutation(1, MutationReason::TrailingActivated));
        assert_eq!(
            q.schedule(mutation(2, MutationReason::StopLossUpdate)),
            ScheduleOutcome::Evicted {
                priority: Priority::Normal
            }
        );

        // Nothing evictable for a Normal when only High is queued.
        let q = MutationQueue::new(1);
        q.schedule(mutation(1, MutationReason::FillConfirmed));
        assert_eq!(
            q.schedule(mutation(2, MutationReason::StopLossUpdate)),
            ScheduleOutcome::Rejected
        );
    }

    #[test]
    fn test_high_never_dropped() {
        let q = MutationQueue::new(2);
        q.schedule(mutation(1, MutationReason::FillConfirmed));
        q.schedule(mutation(2, MutationReason::StopLossUpdate));
        assert_eq!(
            q.schedule(mutation(3, MutationReason::Exit)),
            ScheduleOutcome::Overflow
        );
        assert_eq!(q.depth(), 3);
    }

    #[test]
    fn test_closed_queue() {
        let q = MutationQueue::new(2);
        q.close();
        assert_eq!(
            q.schedule(mutation(1, MutationReason::Exit)),
            ScheduleOutcome::Closed
        );
        assert!(!ScheduleOutcome::Closed.is_queued());
        assert!(q.pop_batch(10).is_none());
    }

    #[test]
    fn test_queued_before_close_is_still_drained() {
        let q = MutationQueue::new(4);
        q.schedule(mutation(1, MutationReason::Exit));
        q.close();

        let batch = q.pop_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(q.pop_batch(10).is_none());
    }

    #[test]
    fn test_schedule_racing_close_is_applied_or_refused() {
        for _ in 0..50 {
            let q = std::sync::Arc::new(MutationQueue::new(1_000));
            let producer = {
                let q = q.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|i| q.schedule(mutation(*i, MutationReason::Exit)).is_queued())
                        .count()
                })
            };
            q.close();

            let mut drained = 0;
            while let Some(batch) = q.pop_batch(64) {
                drained += batch.len();
            }
            let queued = producer.join().unwrap();
            assert_eq!(drained, queued);
        }
    }
}
