use crate::request::{Pending, RequestId};
use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

/// Per-model waiting area for unassembled requests.
///
/// One FIFO per priority level; higher levels are popped first. Order inside a
/// level is arrival order and is never changed.
pub(crate) struct RequestQueue {
    levels: BTreeMap<u32, VecDeque<Pending>>,
    len: usize,
    rows: usize,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            levels: BTreeMap::new(),
            len: 0,
            rows: 0,
        }
    }

    pub fn push(&mut self, pending: Pending) {
        self.len += 1;
        self.rows += pending.rows();
        self.levels
            .entry(pending.priority())
            .or_insert_with(VecDeque::new)
            .push_back(pending);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queued rows, the unit batch sizes are measured in.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Rows of the request that would be popped next.
    pub fn front_rows(&self) -> Option<usize> {
        self.levels
            .values()
            .rev()
            .find_map(|level| level.front())
            .map(Pending::rows)
    }

    /// Arrival of the oldest queued request across all levels.
    pub fn oldest_arrival(&self) -> Option<Instant> {
        self.levels
            .values()
            .filter_map(|level| level.front())
            .map(|pending| pending.arrive_time)
            .min()
    }

    /// Pop up to `max_rows` rows. The first request is always taken; filling
    /// stops at the first request that does not fit.
    ///
    /// Requests that arrived at or before `overdue` are taken ahead of
    /// priority order, so a delay-triggered cut always carries the requests
    /// that triggered it.
    pub fn pop_batch(&mut self, max_rows: usize, overdue: Option<Instant>) -> Vec<Pending> {
        let mut batch = vec![];
        let mut rows = 0;
        let mut full = false;
        if let Some(cutoff) = overdue {
            full = self.fill(&mut batch, &mut rows, max_rows, |pending| {
                pending.arrive_time <= cutoff
            });
        }
        if !full {
            self.fill(&mut batch, &mut rows, max_rows, |_| true);
        }
        self.levels.retain(|_, level| !level.is_empty());
        self.len -= batch.len();
        self.rows -= rows;
        batch
    }

    // returns true once a request did not fit
    fn fill<F>(
        &mut self,
        batch: &mut Vec<Pending>,
        rows: &mut usize,
        max_rows: usize,
        take: F,
    ) -> bool
    where
        F: Fn(&Pending) -> bool,
    {
        for level in self.levels.values_mut().rev() {
            while let Some(front) = level.front() {
                if !take(front) {
                    break;
                }
                if !batch.is_empty() && *rows + front.rows() > max_rows {
                    return true;
                }
                if let Some(pending) = level.pop_front() {
                    *rows += pending.rows();
                    batch.push(pending);
                }
            }
        }
        false
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let (priority, index) = self.levels.iter().find_map(|(&priority, level)| {
            level
                .iter()
                .position(|pending| pending.id == id)
                .map(|index| (priority, index))
        })?;
        let level = self.levels.get_mut(&priority)?;
        let pending = level.remove(index)?;
        if level.is_empty() {
            self.levels.remove(&priority);
        }
        self.len -= 1;
        self.rows -= pending.rows();
        Some(pending)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{InferRequest, Pending};
    use std::time::Duration;

    fn pending(id: u64, rows: usize, priority: u32) -> Pending {
        let request = InferRequest::new("m", vec![])
            .batch_size(rows)
            .priority(priority);
        Pending::new(id, request).0
    }

    fn ids(batch: &[Pending]) -> Vec<u64> {
        batch.iter().map(|pending| pending.id).collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = RequestQueue::new();
        queue.push(pending(0, 1, 0));
        queue.push(pending(1, 1, 2));
        queue.push(pending(2, 1, 0));
        queue.push(pending(3, 1, 2));
        assert_eq!(queue.len(), 4);
        assert_eq!(ids(&queue.pop_batch(3, None)), vec![1, 3, 0]);
        assert_eq!(ids(&queue.pop_batch(3, None)), vec![2]);
        assert!(queue.is_empty());
        assert_eq!(queue.rows(), 0);
    }

    #[test]
    fn test_rows_cap_keeps_order() {
        let mut queue = RequestQueue::new();
        queue.push(pending(0, 2, 0));
        queue.push(pending(1, 3, 0));
        queue.push(pending(2, 1, 0));
        assert_eq!(queue.rows(), 6);
        // id 2 would fit but must not overtake id 1
        assert_eq!(ids(&queue.pop_batch(4, None)), vec![0]);
        assert_eq!(queue.front_rows(), Some(3));
        assert_eq!(ids(&queue.pop_batch(4, None)), vec![1, 2]);
    }

    #[test]
    fn test_overdue_first() {
        let mut queue = RequestQueue::new();
        queue.push(pending(0, 1, 0));
        std::thread::sleep(Duration::from_millis(2));
        let cutoff = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        queue.push(pending(1, 1, 5));
        queue.push(pending(2, 1, 5));
        assert_eq!(queue.oldest_arrival(), Some(queue.levels[&0][0].arrive_time));
        assert_eq!(ids(&queue.pop_batch(2, Some(cutoff))), vec![0, 1]);
        assert_eq!(ids(&queue.pop_batch(2, Some(cutoff))), vec![2]);
    }

    #[test]
    fn test_remove() {
        let mut queue = RequestQueue::new();
        queue.push(pending(0, 1, 0));
        queue.push(pending(1, 2, 1));
        assert_eq!(queue.remove(1).map(|p| p.id), Some(1));
        assert!(queue.remove(1).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.rows(), 1);
    }
}
