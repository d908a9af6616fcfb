use std::collections::VecDeque;

/// Items keyed by a dense, increasing index, retained in a sliding window
/// `[first, next)`.
///
/// `prune` only ever moves `first` forward. Pruning past `next` empties the
/// queue and makes the next pushed item land at the new `first`.
#[derive(Clone, Debug)]
pub struct IndexQueue<T> {
    first: u64,
    items: VecDeque<T>,
}

impl<T> Default for IndexQueue<T> {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl<T> IndexQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        IndexQueue {
            first,
            items: VecDeque::new(),
        }
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn next(&self) -> u64 {
        self.first + self.items.len() as u64
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, idx: u64) -> bool {
        idx >= self.first && idx < self.next()
    }

    /// Appends at `next()` and returns the index used.
    pub fn push_back(&mut self, item: T) -> u64 {
        let idx = self.next();
        self.items.push_back(item);
        idx
    }

    pub fn get(&self, idx: u64) -> Option<&T> {
        if idx < self.first {
            return None;
        }
        self.items.get((idx - self.first) as usize)
    }

    pub fn get_mut(&mut self, idx: u64) -> Option<&mut T> {
        if idx < self.first {
            return None;
        }
        self.items.get_mut((idx - self.first) as usize)
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Returns the item at `idx`, filling any gap up to it with `fill()`.
    /// Returns `None` if `idx` was already pruned.
    pub fn get_or_fill(&mut self, idx: u64, mut fill: impl FnMut() -> T) -> Option<&mut T> {
        if idx < self.first {
            return None;
        }
        while self.next() <= idx {
            self.items.push_back(fill());
        }
        self.get_mut(idx)
    }

    /// Drops every item below `new_first`. Idempotent and monotonic.
    /// Returns true if the window moved.
    pub fn prune(&mut self, new_first: u64) -> bool {
        if new_first <= self.first {
            return false;
        }
        let drop = (new_first - self.first).min(self.items.len() as u64) as usize;
        self.items.drain(..drop);
        self.first = new_first;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        let first = self.first;
        self.items.iter().enumerate().map(move |(i, item)| (first + i as u64, item))
    }
}
