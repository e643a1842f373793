use machine_learning::{MlErr, dataset::Dataset};
use ndarray::Array2;
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};

/// A minibatch of samples, one per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    /// One-hot rows for classification.
    pub targets: Array2<f32>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>, targets: Array2<f32>) -> Self {
        Self { inputs, targets }
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// A batch, or why it could not be assembled.
pub type Loaded = Result<Batch, MlErr>;

/// A finite sequence of batches that can be walked again from the start.
pub trait DataProducer: Sync {
    /// Starts a new pass over the data. A pass that yields an error is abandoned.
    fn batches(&self) -> Box<dyn Iterator<Item = Loaded> + Send + '_>;
}

impl DataProducer for Vec<Batch> {
    fn batches(&self) -> Box<dyn Iterator<Item = Loaded> + Send + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}

/// Serves a `Dataset` in batches, reshuffled on every pass when asked to.
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: Option<Mutex<StdRng>>,
}

impl DataLoader {
    /// Creates a loader that serves the rows in order.
    ///
    /// # Arguments
    /// * `dataset` - The samples to serve.
    /// * `batch_size` - The amount of rows per batch, the last batch may be smaller.
    pub fn new(dataset: Dataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: None,
        }
    }

    /// Serves the rows in a different random order on every pass.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = Some(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// The amount of batches of a pass.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }
}

impl DataProducer for DataLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Loaded> + Send + '_> {
        let order = match &self.shuffle {
            Some(rng) => self.dataset.shuffled_indices(&mut *rng.lock()),
            None => (0..self.dataset.len()).collect(),
        };

        let batch_size = self.batch_size;
        let mut start = 0;

        Box::new(std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }

            let end = (start + batch_size).min(order.len());
            let indices = &order[start..end];
            start = end;

            Some(
                self.dataset
                    .gather(indices)
                    .map(|(inputs, targets)| Batch { inputs, targets }),
            )
        }))
    }
}
