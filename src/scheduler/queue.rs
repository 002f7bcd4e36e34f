//! Priority queue of queued tasks.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use uuid::Uuid;

use super::task::Task;

/// Ordering key: priority descending, then enqueue sequence ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
    id: Uuid,
}

impl QueueKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: Reverse(task.spec.priority),
            seq: task.seq,
            id: task.id,
        }
    }
}

/// Queued task ids in scheduling order.
///
/// An ordered set rather than a heap: a scheduling pass walks the queue in
/// order and takes the first task whose category has capacity, leaving the
/// rest where they are.
#[derive(Debug, Default)]
pub struct TaskQueue {
    keys: BTreeSet<QueueKey>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: &Task) {
        self.keys.insert(QueueKey::of(task));
    }

    pub fn remove(&mut self, task: &Task) -> bool {
        self.keys.remove(&QueueKey::of(task))
    }

    pub fn contains(&self, task: &Task) -> bool {
        self.keys.contains(&QueueKey::of(task))
    }

    /// Task ids, highest priority first, FIFO within a priority.
    pub fn iter(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.keys.iter().map(|k| k.id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskSpec;
    use serde_json::Value;

    fn task(priority: i32, seq: u64) -> Task {
        Task::new(TaskSpec::new("rust", priority, Value::Null), seq)
    }

    #[test]
    fn equal_priority_is_fifo() {
        let (a, b, c) = (task(0, 1), task(0, 2), task(0, 3));
        let mut queue = TaskQueue::new();
        queue.push(&c);
        queue.push(&a);
        queue.push(&b);
        let order: Vec<Uuid> = queue.iter().collect();
        assert_eq!(order, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn higher_priority_jumps_ahead() {
        let (low1, low2, high) = (task(1, 1), task(1, 2), task(5, 3));
        let mut queue = TaskQueue::new();
        queue.push(&low1);
        queue.push(&low2);
        queue.push(&high);
        assert_eq!(queue.iter().next(), Some(high.id));
    }

    #[test]
    fn remove_by_task() {
        let (a, b) = (task(0, 1), task(0, 2));
        let mut queue = TaskQueue::new();
        queue.push(&a);
        queue.push(&b);
        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert!(!queue.contains(&a));
        assert_eq!(queue.len(), 1);
    }
}
