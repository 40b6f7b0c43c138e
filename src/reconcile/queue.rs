// src/reconcile/queue.rs

//! Front-consumed work queue with head re-insertion
//!
//! Drains take the head, attempt it, and on a transient failure put the same
//! item back at the head. Later items are never attempted before the head
//! either succeeds or is skipped by an operator.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for ReconciliationQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> ReconciliationQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next item to work on
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put a failed item back so it is retried first
    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Append during queue construction
    pub fn push_back(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> FromIterator<T> for ReconciliationQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for ReconciliationQueue<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_head_is_retried_first() {
        let mut queue: ReconciliationQueue<&str> = ["a", "b", "c"].into_iter().collect();

        let head = queue.pop_front().unwrap();
        assert_eq!(head, "a");
        queue.push_front(head);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front(), Some(&"a"));
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drain_to_empty() {
        let mut queue = ReconciliationQueue::new();
        queue.push_back(1);
        queue.push_back(2);

        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert!(queue.is_empty());
        assert_eq!(queue.pop_front(), None);
    }
}
