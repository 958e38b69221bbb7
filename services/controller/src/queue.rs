//! Event queue and deduplicator.
//!
//! Identities (kind + key) are queued for reconciliation. The queue holds each
//! identity at most once, and hands an identity to at most one worker at a
//! time: an identity enqueued while a worker holds it is parked and re-queued
//! when that worker calls [`WorkQueue::done`]. Events carry no payload, so
//! coalescing never loses information; the reconciler always reads current
//! state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kubesolv_events::Trigger;
use kubesolv_id::ObjectRef;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// What happened to an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Added to the ready queue.
    Queued,
    /// Already waiting; merged with the pending entry.
    Coalesced,
    /// A worker holds the identity; it is re-queued once that worker is done.
    Deferred,
    /// Will be queued when the delay elapses.
    Scheduled,
    /// The queue is shutting down.
    Closed,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<ObjectRef>,
    queued: HashSet<ObjectRef>,
    active: HashSet<ObjectRef>,
    deferred: HashSet<ObjectRef>,
    delayed: HashMap<ObjectRef, Instant>,
    shutting_down: bool,
}

/// Counters kept by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub coalesced: u64,
    pub deferred: u64,
    pub dequeued: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    coalesced: AtomicU64,
    deferred: AtomicU64,
    dequeued: AtomicU64,
}

/// Deduplicating work queue with per-identity mutual exclusion.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    counters: Counters,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `target` for reconciliation.
    pub fn enqueue(&self, target: ObjectRef, trigger: Trigger) -> Enqueued {
        let outcome = {
            let mut state = self.lock();
            if state.shutting_down {
                Enqueued::Closed
            } else if state.queued.contains(&target) {
                Enqueued::Coalesced
            } else if state.active.contains(&target) {
                if state.deferred.insert(target.clone()) {
                    Enqueued::Deferred
                } else {
                    Enqueued::Coalesced
                }
            } else {
                state.delayed.remove(&target);
                state.queued.insert(target.clone());
                state.order.push_back(target.clone());
                Enqueued::Queued
            }
        };

        match outcome {
            Enqueued::Queued => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            Enqueued::Coalesced => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            Enqueued::Deferred => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            }
            Enqueued::Scheduled | Enqueued::Closed => {}
        }
        trace!(target = %target, trigger = %trigger, outcome = ?outcome, "Enqueue");
        outcome
    }

    /// Queue `target` once `delay` has elapsed.
    ///
    /// Several pending delays for one identity collapse into the earliest.
    pub fn enqueue_after(self: &Arc<Self>, target: ObjectRef, delay: Duration) -> Enqueued {
        if delay.is_zero() {
            return self.enqueue(target, Trigger::Requeue);
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return Enqueued::Closed;
            }
            if state.queued.contains(&target) {
                return Enqueued::Coalesced;
            }
            if state
                .delayed
                .get(&target)
                .is_some_and(|existing| *existing <= deadline)
            {
                return Enqueued::Coalesced;
            }
            state.delayed.insert(target.clone(), deadline);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire_delayed(target, deadline);
        });
        Enqueued::Scheduled
    }

    fn fire_delayed(&self, target: ObjectRef, deadline: Instant) {
        let due = {
            let mut state = self.lock();
            if state.delayed.get(&target) == Some(&deadline) {
                state.delayed.remove(&target);
                true
            } else {
                false
            }
        };
        if due {
            self.enqueue(target, Trigger::Requeue);
        }
    }

    /// Wait for the next identity. Returns `None` once the queue shuts down.
    ///
    /// The caller owns the identity until it calls [`WorkQueue::done`].
    pub async fn dequeue(&self) -> Option<ObjectRef> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(target) = state.order.pop_front() {
                    state.queued.remove(&target);
                    state.active.insert(target.clone());
                    self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(target);
                }
            }

            notified.await;
        }
    }

    /// Release an identity taken by [`WorkQueue::dequeue`].
    pub fn done(&self, target: &ObjectRef) {
        let requeued = {
            let mut state = self.lock();
            state.active.remove(target);
            if state.deferred.remove(target) && !state.shutting_down {
                state.queued.insert(target.clone());
                state.order.push_back(target.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.delayed.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Identities ready or parked, excluding delayed ones.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.order.len() + state.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().active.len()
    }

    /// Identities waiting on a delay.
    pub fn delayed(&self) -> usize {
        self.lock().delayed.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use kubesolv_events::WatchEventKind;
    use kubesolv_id::{ObjectKey, ResourceKind};

    use super::*;

    fn target(name: &str) -> ObjectRef {
        ObjectRef::new(
            ResourceKind::Solver,
            ObjectKey::new("default", name).unwrap(),
        )
    }

    const UPDATED: Trigger = Trigger::Watch(WatchEventKind::Updated);

    #[tokio::test]
    async fn test_duplicate_enqueues_coalesce() {
        let queue = WorkQueue::new();
        assert_eq!(queue.enqueue(target("a"), UPDATED), Enqueued::Queued);
        assert_eq!(queue.enqueue(target("a"), UPDATED), Enqueued::Coalesced);
        assert_eq!(queue.enqueue(target("b"), UPDATED), Enqueued::Queued);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().await, Some(target("a")));
        assert_eq!(queue.dequeue().await, Some(target("b")));
        assert_eq!(queue.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_enqueue_while_active_is_deferred_until_done() {
        let queue = WorkQueue::new();
        queue.enqueue(target("a"), UPDATED);
        let taken = queue.dequeue().await.unwrap();

        assert_eq!(queue.enqueue(target("a"), UPDATED), Enqueued::Deferred);
        assert_eq!(queue.enqueue(target("a"), UPDATED), Enqueued::Coalesced);
        assert_eq!(queue.lock().order.len(), 0);

        queue.done(&taken);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.dequeue().await, Some(target("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.enqueue(target("a"), UPDATED), Enqueued::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue_keeps_earliest_deadline() {
        let queue = Arc::new(WorkQueue::new());
        assert_eq!(
            queue.enqueue_after(target("a"), Duration::from_secs(10)),
            Enqueued::Scheduled
        );
        assert_eq!(
            queue.enqueue_after(target("a"), Duration::from_secs(20)),
            Enqueued::Coalesced
        );
        assert_eq!(
            queue.enqueue_after(target("a"), Duration::from_secs(5)),
            Enqueued::Scheduled
        );
        assert_eq!(queue.delayed(), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delayed(), 0);

        // The superseded 10s timer must not queue a second time.
        let taken = queue.dequeue().await.unwrap();
        queue.done(&taken);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_in_flight_per_identity() {
        let queue = Arc::new(WorkQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let processed = Arc::clone(&processed);
            workers.push(tokio::spawn(async move {
                while let Some(taken) = queue.dequeue().await {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&taken);
                }
            }));
        }

        for _ in 0..50 {
            queue.enqueue(target("hot"), UPDATED);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        while !queue.is_empty() || queue.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(processed.load(Ordering::SeqCst) >= 1);
        assert!(processed.load(Ordering::SeqCst) <= 50);
    }
}
