use std::ops::Range;

/// The batch size the base learning rate constant is expressed for.
pub const REFERENCE_BATCH_SIZE: usize = 256;

/// Linear learning rate scaling: `base * batch_size * node_count / reference_batch_size`.
pub fn effective_lr(base: f32, batch_size: usize, node_count: usize) -> f32 {
    ScalingPolicy::new(base).effective_lr(batch_size, node_count)
}

/// Derives the learning rate and the batch composition of a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub base_lr: f32,
    pub reference_batch_size: usize,
}

impl ScalingPolicy {
    pub fn new(base_lr: f32) -> Self {
        Self {
            base_lr,
            reference_batch_size: REFERENCE_BATCH_SIZE,
        }
    }

    pub fn effective_lr(&self, batch_size: usize, node_count: usize) -> f32 {
        self.base_lr * batch_size as f32 * node_count as f32 / self.reference_batch_size as f32
    }

    /// The amount of samples one optimizer step sees across every node.
    pub fn global_batch_size(&self, batch_size: usize, node_count: usize) -> usize {
        batch_size * node_count
    }

    /// Splits `rows` evenly among at most `replicas` shards, the first shards
    /// taking the remainder.
    ///
    /// # Returns
    /// The non empty, contiguous row ranges, in order.
    pub fn split_batch(rows: usize, replicas: usize) -> Vec<Range<usize>> {
        if replicas == 0 {
            return Vec::new();
        }

        let base = rows / replicas;
        let remainder = rows % replicas;
        let mut start = 0;

        (0..replicas)
            .map(|i| if i < remainder { base + 1 } else { base })
            .take_while(|&size| size > 0)
            .map(|size| {
                let range = start..start + size;
                start += size;
                range
            })
            .collect()
    }
}
