//! The four process-wide queues (spec.md §3 "Queues", §9 "tuple-priority
//! queue with payload that may not be comparable").
//!
//! Each queue pairs a `parking_lot::Mutex` with an `async_condvar_fair`
//! condition variable, the pattern the teacher's Cargo.toml pulls in
//! `async-condvar-fair` for (see DESIGN.md).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use async_condvar_fair::Condvar;
use parking_lot::Mutex;

/// Wraps a payload with an `i64` priority key, comparing only on the key
/// so the payload itself never needs to implement `Ord` (§9).
struct PriorityItem<T> {
    priority: i64,
    // Insertion sequence number, used to break ties in FIFO order
    // (spec.md §8 "stable for equal priorities by insertion order").
    seq: u64,
    payload: T,
}

impl<T> PartialEq for PriorityItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T> Eq for PriorityItem<T> {}

impl<T> PartialOrd for PriorityItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PriorityItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; lower priority value means "sooner",
        // so invert, and invert sequence too so earlier insertions pop
        // first among equal priorities.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PriorityQueueInner<T> {
    heap: BinaryHeap<PriorityItem<T>>,
    next_seq: u64,
}

/// FIFO queue shared between producers and a pool of consuming workers.
pub struct WorkQueue<T> {
    inner: Mutex<VecDeque<T>>,
    condvar: Condvar,
}

impl<T: Send> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut guard = self.inner.lock();
        guard.push_back(item);
        drop(guard);
        self.condvar.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Blocks (asynchronously) until an item is available, then pops it.
    pub async fn pop(&self) -> T {
        let mut guard = self.inner.lock();
        loop {
            if let Some(item) = guard.pop_front() {
                return item;
            }
            guard = self.condvar.wait(guard).await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }
}

/// Priority queue used for the Test queue (spec.md "priority queue, key =
/// integer priority, lower = sooner").
pub struct PriorityQueue<T> {
    inner: Mutex<PriorityQueueInner<T>>,
    condvar: Condvar,
}

impl<T: Send> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PriorityQueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn push(&self, priority: i64, item: T) {
        let mut guard = self.inner.lock();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.heap.push(PriorityItem {
            priority,
            seq,
            payload: item,
        });
        drop(guard);
        self.condvar.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub async fn pop(&self) -> T {
        let mut guard = self.inner.lock();
        loop {
            if let Some(item) = guard.heap.pop() {
                return item.payload;
            }
            guard = self.condvar.wait(guard).await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().heap.pop().map(|i| i.payload)
    }
}

/// Test-queue priority formula (spec.md §3 "Priority assignment"). The
/// spec names several historical variants; this adopts the most recent
/// one per §9 Open Question.
pub fn test_priority(
    is_initial_phase: bool,
    high_priority_item: bool,
    build_number: u64,
    timeout_secs: u64,
) -> i64 {
    const SHORT_TEST_TIMEOUT_SECS: u64 = 1000;
    if is_initial_phase {
        0
    } else if high_priority_item {
        3
    } else if timeout_secs <= SHORT_TEST_TIMEOUT_SECS {
        build_number as i64
    } else {
        build_number as i64 * 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_case::test_case;

    #[test_case(true, false, 5, 2000, 0 ; "initial phase always wins regardless of priority or timeout")]
    #[test_case(false, true, 5, 2000, 3 ; "high priority item outranks build number")]
    #[test_case(false, false, 5, 1000, 5 ; "short test keyed on bare build number")]
    #[test_case(false, false, 5, 1001, 500 ; "long test scaled by 100x")]
    fn test_priority_formula(
        is_initial_phase: bool,
        high_priority_item: bool,
        build_number: u64,
        timeout_secs: u64,
        expected: i64,
    ) {
        assert_eq!(
            test_priority(is_initial_phase, high_priority_item, build_number, timeout_secs),
            expected
        );
    }

    #[tokio::test]
    async fn fifo_preserves_order() {
        let q: WorkQueue<i32> = WorkQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop().await, 1);
        assert_eq!(q.pop().await, 2);
        assert_eq!(q.pop().await, 3);
    }

    #[tokio::test]
    async fn fifo_pop_blocks_until_push() {
        let q: Arc<WorkQueue<i32>> = Arc::new(WorkQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(99);
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(got, 99);
    }

    #[tokio::test]
    async fn priority_queue_lower_value_pops_first() {
        let q: PriorityQueue<&str> = PriorityQueue::new();
        q.push(100, "slow");
        q.push(0, "initial");
        q.push(3, "high-priority");
        assert_eq!(q.pop().await, "initial");
        assert_eq!(q.pop().await, "high-priority");
        assert_eq!(q.pop().await, "slow");
    }

    #[tokio::test]
    async fn priority_queue_ties_are_fifo() {
        let q: PriorityQueue<i32> = PriorityQueue::new();
        q.push(5, 1);
        q.push(5, 2);
        q.push(5, 3);
        assert_eq!(q.pop().await, 1);
        assert_eq!(q.pop().await, 2);
        assert_eq!(q.pop().await, 3);
    }

    #[test]
    fn priority_formula_matches_spec_table() {
        assert_eq!(test_priority(true, false, 500, 2000), 0);
        assert_eq!(test_priority(false, true, 500, 2000), 3);
        assert_eq!(test_priority(false, false, 500, 500), 500);
        assert_eq!(test_priority(false, false, 500, 2000), 50000);
    }
}
