//! Bounded ring with an explicit EOF marker.

use std::collections::VecDeque;

/// Plain single-threaded bounded queue. Blocking, waking and close flags
/// live a level up; this type only knows capacity, order and EOF.
#[derive(Debug)]
pub(crate) struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
    eof: bool,
}

impl<T> Ring<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            eof: false,
        }
    }

    pub(crate) fn push(&mut self, value: T) -> Result<(), T> {
        if self.items.len() == self.capacity {
            return Err(value);
        }
        self.items.push_back(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn free(&self) -> usize {
        self.capacity - self.items.len()
    }

    pub(crate) fn push_eof(&mut self) {
        self.eof = true;
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(16)]
    fn test_fill_and_drain_preserves_order(#[case] capacity: usize) {
        let mut ring = Ring::new(capacity);

        for i in 0..capacity {
            assert!(ring.push(i).is_ok());
        }
        assert_eq!(ring.push(capacity), Err(capacity));

        for i in 0..capacity {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_eof_is_sticky_and_orthogonal_to_content() {
        let mut ring = Ring::new(4);
        ring.push(1).unwrap();
        ring.push_eof();

        assert!(ring.is_eof());
        assert_eq!(ring.pop(), Some(1));
        assert!(ring.is_eof());
        assert_eq!(ring.pop(), None);
    }
}
