use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use log::info;

/// The epoch a session is in, shared with the range that drives it.
#[derive(Debug, Clone, Default)]
pub(crate) struct EpochCursor(Arc<AtomicUsize>);

impl EpochCursor {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, epoch: usize) {
        self.0.store(epoch, Ordering::Release);
    }
}

/// The epochs of a session, `0..n`. Moves the session's cursor as it is consumed.
#[derive(Debug)]
pub struct EpochRange {
    next: usize,
    end: usize,
    cursor: EpochCursor,
}

impl EpochRange {
    pub(crate) fn new(end: usize, cursor: EpochCursor) -> Self {
        Self {
            next: 0,
            end,
            cursor,
        }
    }
}

impl Iterator for EpochRange {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next >= self.end {
            return None;
        }

        let epoch = self.next;
        self.next += 1;
        self.cursor.set(epoch);
        info!(epoch = epoch, epochs = self.end; "epoch started");

        Some(epoch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for EpochRange {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_each_epoch_once_in_order() {
        let cursor = EpochCursor::default();
        let epochs: Vec<usize> = EpochRange::new(4, cursor.clone()).collect();
        assert_eq!(epochs, vec![0, 1, 2, 3]);
        assert_eq!(cursor.get(), 3);
    }

    #[test]
    fn cursor_follows_consumption() {
        let cursor = EpochCursor::default();
        let mut range = EpochRange::new(3, cursor.clone());
        assert_eq!(range.len(), 3);

        range.next();
        range.next();
        assert_eq!(cursor.get(), 1);
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn empty_range_runs_nothing() {
        assert_eq!(EpochRange::new(0, EpochCursor::default()).count(), 0);
    }
}
