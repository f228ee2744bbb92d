use std::collections::VecDeque;

/// FIFO with a hard length bound, dropping the oldest item on overflow.
///
/// Every pushed item gets a sequence number so that a consumer can acknowledge a batch
/// even if some of its items were evicted in the meantime.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<(u64, T)>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

/// Head of a queue taken for delivery.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Sequence number of the last item in `items`
    pub last_seq: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Appends an item, returns how many items were dropped to make room.
    pub fn push(&mut self, item: T) -> usize {
        let mut dropped_now = 0;

        while self.items.len() >= self.capacity {
            self.items.pop_front();
            dropped_now += 1;
        }

        self.dropped += dropped_now as u64;
        self.items.push_back((self.next_seq, item));
        self.next_seq += 1;

        dropped_now
    }

    /// Removes every item up to and including `seq`, returns how many were removed.
    pub fn remove_through(&mut self, seq: u64) -> usize {
        let mut removed = 0;

        while self.items.front().is_some_and(|(item_seq, _)| *item_seq <= seq) {
            self.items.pop_front();
            removed += 1;
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items dropped by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copies up to `max` items from the head, without removing them.
    pub fn head(&self, max: usize) -> Option<Batch<T>> {
        let mut last_seq = None;

        let items = self
            .items
            .iter()
            .take(max)
            .map(|(seq, item)| {
                last_seq = Some(*seq);
                item.clone()
            })
            .collect();

        last_seq.map(|last_seq| Batch { items, last_seq })
    }

    /// Newest `n` items, oldest first.
    pub fn newest(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).map(|(_, item)| item.clone()).collect()
    }
}
