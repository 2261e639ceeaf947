use std::collections::VecDeque;

/// Per-rank list of pending work items.
///
/// Items produced locally go to the front so recursive searches stay
/// depth-first; items donated by a peer go to the back. Consumers and donors
/// both take from the front.
#[derive(Debug)]
pub struct LocalQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for LocalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Add a locally produced item.
    pub fn push_local(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Add an item received from a donor.
    pub fn push_donated(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Take the next item to process or donate.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove up to `count` items from the front, in order.
    pub fn take_front(&mut self, count: usize) -> Vec<T> {
        let count = count.min(self.items.len());
        self.items.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
