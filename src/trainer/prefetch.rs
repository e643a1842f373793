use std::{iter, thread};

use log::debug;
use tokio::sync::mpsc;

use crate::data::{DataProducer, Loaded};

/// Runs `f` over a pass of `producer`.
///
/// With a `depth`, batches are produced on a background thread and buffered up
/// to `depth` ahead of the consumer. The thread is stopped and joined before
/// returning, even when `f` stops early.
pub(crate) fn with_batches<P, F, T>(producer: &P, depth: Option<usize>, f: F) -> T
where
    P: DataProducer + ?Sized,
    F: FnOnce(&mut dyn Iterator<Item = Loaded>) -> T,
{
    let Some(depth) = depth else {
        return f(&mut producer.batches());
    };

    thread::scope(|s| {
        let (tx, mut rx) = mpsc::channel(depth.max(1));

        s.spawn(move || {
            for (i, batch) in producer.batches().enumerate() {
                if tx.blocking_send(batch).is_err() {
                    debug!(batch = i; "consumer left, prefetching stopped");
                    break;
                }
            }
        });

        // Owns the receiver: dropping it on return unblocks the producer.
        let mut batches = iter::from_fn(move || rx.blocking_recv());
        f(&mut batches)
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::data::Batch;

    fn batches(n: usize) -> Vec<Batch> {
        (0..n)
            .map(|i| Batch::new(Array2::from_elem((1, 1), i as f32), Array2::zeros((1, 1))))
            .collect()
    }

    fn firsts(it: &mut dyn Iterator<Item = Loaded>) -> Vec<f32> {
        it.map(|b| b.unwrap().inputs[[0, 0]]).collect()
    }

    #[test]
    fn prefetching_keeps_the_order() {
        let producer = batches(20);
        assert_eq!(
            with_batches(&producer, Some(2), firsts),
            with_batches(&producer, None, firsts)
        );
    }

    #[test]
    fn stopping_early_does_not_hang() {
        let producer = batches(100);
        let taken = with_batches(&producer, Some(1), |it| it.take(3).count());
        assert_eq!(taken, 3);
    }
}
