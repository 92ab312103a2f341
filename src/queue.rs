//! Loading queue with an approximate, incrementally maintained priority order.

use std::collections::VecDeque;

#[cfg(feature = "profiler")]
use thread_profiler::profile_scope;

/// Queue of pending loads, ordered by ascending priority value.
///
/// The order is only eventually correct: every call to `refresh_priorities`
/// re-evaluates a batch of entries and runs a single reverse bubble pass,
/// which carries the most urgent entry to the front and moves everything else
/// one step closer to its place. Without new insertions the queue is fully
/// sorted after `len` refreshes.
///
/// Entries are identified by `PartialEq` on the item, never by priority.
#[derive(Debug)]
pub struct LoadingQueue<T> {
    entries: VecDeque<(T, f32)>,
    refresh_cursor: usize,
}

impl<T> Default for LoadingQueue<T> {
    fn default() -> Self {
        LoadingQueue {
            entries: VecDeque::new(),
            refresh_cursor: 0,
        }
    }
}

impl<T: PartialEq> LoadingQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts an entry in front of everything else.
    pub fn push_front(&mut self, item: T, priority: f32) {
        self.entries.push_front((item, priority));
    }

    /// Appends an entry; it moves forward as priorities get refreshed.
    pub fn push_back(&mut self, item: T, priority: f32) {
        self.entries.push_back((item, priority));
    }

    /// Removes and returns the first entry.
    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front().map(|(item, _)| item)
    }

    /// The first entry and its priority.
    pub fn front(&self) -> Option<(&T, f32)> {
        self.entries.front().map(|(item, priority)| (item, *priority))
    }

    /// Whether `item` is in the queue.
    pub fn contains(&self, item: &T) -> bool {
        self.position(item).is_some()
    }

    /// Index of `item`, if queued.
    pub fn position(&self, item: &T) -> Option<usize> {
        self.entries.iter().position(|(other, _)| other == item)
    }

    /// Removes `item` by swapping the last entry into its place.
    ///
    /// Returns `false` if the item is not queued.
    pub fn remove(&mut self, item: &T) -> bool {
        match self.position(item) {
            Some(index) => {
                self.entries.swap_remove_back(index);
                true
            }
            None => false,
        }
    }

    /// Iterates entries front to back.
    pub fn iter(&self) -> impl Iterator<Item = (&T, f32)> + '_ {
        self.entries.iter().map(|(item, priority)| (item, *priority))
    }

    /// Removes all entries, returning them front to back.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.refresh_cursor = 0;
        self.entries.drain(..).map(|(item, _)| item)
    }

    /// Whether the entries are in ascending priority order.
    pub fn is_sorted(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|((_, a), (_, b))| a <= b)
    }

    /// Re-evaluates up to `batch` entries starting at a rotating cursor, then
    /// runs one reverse bubble pass over the whole queue.
    pub fn refresh_priorities<F>(&mut self, batch: usize, mut priority_of: F)
    where
        F: FnMut(&T) -> f32,
    {
        #[cfg(feature = "profiler")]
        profile_scope!("refresh_loading_priorities");

        let count = self.entries.len();
        if count == 0 {
            return;
        }

        self.refresh_cursor = self.refresh_cursor.min(count);
        let mut update_count = batch.min(count - self.refresh_cursor);

        if update_count == 0 {
            self.refresh_cursor = 0;
            update_count = batch.min(count);
        }

        if update_count == 0 {
            return;
        }

        for _ in 0..update_count {
            let entry = &mut self.entries[self.refresh_cursor];
            entry.1 = priority_of(&entry.0);
            self.refresh_cursor += 1;
        }

        self.reverse_bubble_step();
    }

    /// One bubble sort pass from back to front.
    ///
    /// Moves the smallest value to the front and everything else one step
    /// closer to its position, at O(n) per call.
    pub fn reverse_bubble_step(&mut self) {
        for i in (1..self.entries.len()).rev() {
            if self.entries[i - 1].1 > self.entries[i].1 {
                self.entries.swap(i - 1, i);
            }
        }
    }
}
