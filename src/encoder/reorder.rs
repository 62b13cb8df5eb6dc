//! Reorder hold buffer for bi-predicted pictures.
//!
//! Pictures arrive in presentation order but a bi-predicted picture can only
//! be coded after the anchor that follows it. Held pictures wait here until
//! that anchor arrives; the anchor is then released first, followed by the
//! held pictures in presentation order.
//!
//! For example, with 2 B-pictures between anchors:
//! - Presentation order: I(0), B(1), B(2), P(3), B(4), B(5), P(6)
//! - Coding order:       I(0), P(3), B(1), B(2), P(6), B(4), B(5)

use std::collections::VecDeque;

/// Picture waiting in the hold buffer.
#[derive(Debug, Clone)]
pub struct HeldPicture<T> {
    /// Presentation order.
    pub picture_order: u64,
    pub item: T,
}

/// Hold buffer mapping presentation order to coding order.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    held: VecDeque<HeldPicture<T>>,
    capacity: usize,
    /// Next coding order to assign.
    next_encode_order: u64,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer holding at most `capacity` pictures.
    pub fn new(capacity: usize) -> Self {
        Self {
            held: VecDeque::with_capacity(capacity),
            capacity,
            next_encode_order: 0,
        }
    }

    /// Hold a picture until the next anchor.
    ///
    /// Returns the picture back when the buffer is already full.
    pub fn hold(&mut self, picture_order: u64, item: T) -> Result<(), T> {
        if self.held.len() >= self.capacity {
            return Err(item);
        }
        self.held.push_back(HeldPicture {
            picture_order,
            item,
        });
        Ok(())
    }

    /// Release an anchor together with every picture held before it.
    ///
    /// Returns `(encode_order, item)` pairs in coding order.
    pub fn release_with_anchor(&mut self, anchor: T) -> Vec<(u64, T)> {
        let mut released = Vec::with_capacity(self.held.len() + 1);
        released.push((self.assign(), anchor));
        while let Some(held) = self.held.pop_front() {
            released.push((self.assign(), held.item));
        }
        released
    }

    /// Release a picture that nothing waits on. The buffer must be empty.
    pub fn release(&mut self, item: T) -> (u64, T) {
        debug_assert!(self.held.is_empty());
        (self.assign(), item)
    }

    /// Take every held picture in presentation order without assigning a
    /// coding order.
    pub fn take_held(&mut self) -> Vec<HeldPicture<T>> {
        self.held.drain(..).collect()
    }

    /// Assign the next coding order.
    pub fn assign(&mut self) -> u64 {
        let order = self.next_encode_order;
        self.next_encode_order += 1;
        order
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Get number of held pictures.
    pub fn len(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_held_pictures() {
        let mut buffer = ReorderBuffer::new(2);
        assert_eq!(buffer.release('I'), (0, 'I'));
        assert_eq!(buffer.release_with_anchor('P'), vec![(1, 'P')]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_anchor_released_before_held() {
        let mut buffer = ReorderBuffer::new(2);
        assert_eq!(buffer.release("I0"), (0, "I0"));
        buffer.hold(1, "B1").unwrap();
        buffer.hold(2, "B2").unwrap();
        assert_eq!(buffer.len(), 2);

        let released = buffer.release_with_anchor("P3");
        assert_eq!(released, vec![(1, "P3"), (2, "B1"), (3, "B2")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_and_take() {
        let mut buffer = ReorderBuffer::new(1);
        buffer.hold(4, 'B').unwrap();
        assert_eq!(buffer.hold(5, 'C'), Err('C'));

        let held = buffer.take_held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].picture_order, 4);
        assert!(buffer.is_empty());
    }
}
