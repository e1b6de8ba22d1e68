//! Unbounded priority queue shared by executor workers.
//!
//! Items come out in ascending `(priority, seq)` order. `seq` is assigned at
//! push time, so equal priorities are served in submission order. Closing
//! and pushing share the heap lock: once `close` returns, no job gets in.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Type-erased unit of work. Delivers its own result.
pub(crate) type ErasedJob = BoxFuture<'static, ()>;

pub(crate) enum ItemKind {
    Job(ErasedJob),
    /// Stops the worker that pops it.
    Shutdown,
}

pub(crate) struct QueueItem {
    pub priority: i32,
    pub seq: u64,
    pub kind: ItemKind,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // BinaryHeap pops the maximum; invert so the lowest (priority, seq) wins.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueueItem>,
    closed: bool,
}

pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    next_seq: AtomicU64,
    available: Notify,
    /// Pushed but not yet marked done.
    unfinished: AtomicUsize,
    drained: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            next_seq: AtomicU64::new(0),
            available: Notify::new(),
            unfinished: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Queue `kind` unless the queue is closed. Returns whether it was queued.
    pub fn push(&self, priority: i32, kind: ItemKind) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        self.push_locked(&mut state, priority, kind);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Refuse further pushes and queue `sentinels` shutdown items.
    /// Returns false if the queue was already closed.
    pub fn close(&self, sentinels: usize, priority: i32) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        for _ in 0..sentinels {
            self.push_locked(&mut state, priority, ItemKind::Shutdown);
        }
        drop(state);
        for _ in 0..sentinels {
            self.available.notify_one();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn push_locked(&self, state: &mut QueueState, priority: i32, kind: ItemKind) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.unfinished.fetch_add(1, AtomicOrdering::SeqCst);
        state.heap.push(QueueItem {
            priority,
            seq,
            kind,
        });
    }

    pub async fn pop(&self) -> QueueItem {
        loop {
            if let Some(item) = self.state.lock().heap.pop() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Mark one popped item as finished.
    pub fn task_done(&self) {
        if self.unfinished.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every pushed item has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.unfinished.load(AtomicOrdering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn unfinished(&self) -> usize {
        self.unfinished.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_order() {
        let queue = JobQueue::new();
        queue.push(2, ItemKind::Shutdown);
        queue.push(1, ItemKind::Shutdown);
        queue.push(1, ItemKind::Shutdown);
        queue.push(0, ItemKind::Shutdown);

        let mut order = Vec::new();
        for _ in 0..4 {
            let item = queue.pop().await;
            order.push((item.priority, item.seq));
        }
        assert_eq!(order, vec![(0, 3), (1, 1), (1, 2), (2, 0)]);
    }

    #[tokio::test]
    async fn test_join_waits_for_task_done() {
        let queue = std::sync::Arc::new(JobQueue::new());
        queue.push(0, ItemKind::Shutdown);
        let _ = queue.pop().await;
        assert_eq!(queue.unfinished(), 1);

        let q = queue.clone();
        let joiner = tokio::spawn(async move { q.join().await });
        tokio::task::yield_now().await;
        assert!(!joiner.is_finished());

        queue.task_done();
        joiner.await.unwrap();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn test_close_refuses_pushes() {
        let queue = JobQueue::new();
        assert!(queue.push(0, ItemKind::Shutdown));
        assert!(queue.close(2, i32::MAX));
        assert!(!queue.close(2, i32::MAX));
        assert!(!queue.push(0, ItemKind::Shutdown));
        assert_eq!(queue.unfinished(), 3);

        let mut priorities = Vec::new();
        for _ in 0..3 {
            priorities.push(queue.pop().await.priority);
        }
        assert_eq!(priorities, vec![0, i32::MAX, i32::MAX]);
    }
}
