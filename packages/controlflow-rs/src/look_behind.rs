//! Bounded memory of recently emitted elements.
//!
//! A [`LookBehindBuffer`] remembers the last `N` elements a
//! [`ResumableSource`](crate::ResumableSource) handed to its consumer. When a
//! sub-stream fails, the buffer is snapshotted and the snapshot is what the
//! seed-recomputation function sees.
//!
//! The buffer is not cleared by a snapshot, so elements emitted two or more
//! failures ago stay visible until newer elements push them out.

use std::collections::VecDeque;

/// Bounded FIFO of the most recently pushed elements.
///
/// Capacity `0` is legal: every push is dropped and snapshots are empty.
#[derive(Debug, Clone)]
pub struct LookBehindBuffer<E> {
    capacity: usize,
    elements: VecDeque<E>,
}

impl<E> LookBehindBuffer<E> {
    /// Create an empty buffer holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            elements: VecDeque::with_capacity(capacity.saturating_add(1).min(1024)),
        }
    }

    /// Append an element, evicting the oldest while over capacity.
    pub fn push(&mut self, element: E) {
        if self.capacity == 0 {
            return;
        }
        self.elements.push_back(element);
        while self.elements.len() > self.capacity {
            self.elements.pop_front();
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements currently remembered.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.elements.iter()
    }
}

impl<E: Clone> LookBehindBuffer<E> {
    /// Ordered copy of the remembered elements, oldest first.
    ///
    /// The live contents are left intact.
    pub fn snapshot(&self) -> Vec<E> {
        self.elements.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut buffer = LookBehindBuffer::new(3);
        buffer.push(1);
        buffer.push(2);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = LookBehindBuffer::new(2);
        for i in 1..=5 {
            buffer.push(i);
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.snapshot(), vec![4, 5]);
    }

    #[test]
    fn test_zero_capacity_is_always_empty() {
        let mut buffer = LookBehindBuffer::new(0);
        buffer.push("a");
        buffer.push("b");

        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_leaves_contents_intact() {
        let mut buffer = LookBehindBuffer::new(3);
        buffer.push(1);
        buffer.push(2);

        let first = buffer.snapshot();
        buffer.push(3);
        let second = buffer.snapshot();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![1, 2, 3]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = LookBehindBuffer::new(4);
        buffer.push(1);
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 4);
    }

    #[test]
    fn test_randomized_snapshot_is_suffix_of_pushes() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for _ in 0..200 {
            let capacity = rng.usize(0..8);
            let pushes = rng.usize(0..32);
            let mut buffer = LookBehindBuffer::new(capacity);
            let mut all = Vec::new();

            for _ in 0..pushes {
                let value = rng.u32(..);
                buffer.push(value);
                all.push(value);
            }

            let expected_len = pushes.min(capacity);
            let snapshot = buffer.snapshot();
            assert_eq!(snapshot.len(), expected_len);
            assert_eq!(snapshot.as_slice(), &all[all.len() - expected_len..]);
        }
    }
}
