use ndarray::{Array2, ArrayView1};
use rand::{Rng, seq::SliceRandom};
use rand_distr::{Distribution, Normal};

use crate::{MlErr, Result};

/// An in-memory dataset of `(x, y)` samples stored row by row.
///
/// Each row holds `x_size` input values followed by `y_size` target values.
#[derive(Debug, Clone)]
pub struct Dataset {
    x_size: usize,
    y_size: usize,
    len: usize,
    data: Vec<f32>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `data` - The samples, `x_size + y_size` values per row.
    /// * `x_size` - The width of an input.
    /// * `y_size` - The width of a target.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `data` is not a whole amount of rows.
    pub fn new(data: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self> {
        let row = x_size + y_size;
        if row == 0 || data.len() % row != 0 {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows",
                got: data.len(),
                expected: row,
            });
        }

        Ok(Self {
            x_size,
            y_size,
            len: data.len() / row,
            data,
        })
    }

    /// Generates gaussian blobs, one per class, with one-hot targets.
    ///
    /// # Arguments
    /// * `classes` - The amount of classes.
    /// * `features` - The width of each input.
    /// * `per_class` - The amount of samples of each class.
    /// * `spread` - The standard deviation around each class center.
    /// * `rng` - A random number generator.
    pub fn blobs<R: Rng + ?Sized>(
        classes: usize,
        features: usize,
        per_class: usize,
        spread: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let noise =
            Normal::new(0., spread).map_err(|_| MlErr::InvalidInput("invalid blob spread"))?;

        let centers: Vec<Vec<f32>> = (0..classes)
            .map(|_| (0..features).map(|_| rng.random_range(-4.0..4.0)).collect())
            .collect();

        let mut data = Vec::with_capacity(classes * per_class * (features + classes));
        for _ in 0..per_class {
            for (class, center) in centers.iter().enumerate() {
                data.extend(center.iter().map(|c| c + noise.sample(rng)));
                data.extend((0..classes).map(|k| if k == class { 1. } else { 0. }));
            }
        }

        Self::new(data, features, classes)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    fn row(&self, i: usize) -> &[f32] {
        let width = self.x_size + self.y_size;
        &self.data[i * width..(i + 1) * width]
    }

    /// Gathers the given rows into an input and a target matrix.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if an index is out of bounds.
    pub fn gather(&self, indices: &[usize]) -> Result<(Array2<f32>, Array2<f32>)> {
        let mut x = Array2::zeros((indices.len(), self.x_size));
        let mut y = Array2::zeros((indices.len(), self.y_size));

        for (r, &i) in indices.iter().enumerate() {
            if i >= self.len {
                return Err(MlErr::SizeMismatch {
                    what: "dataset index",
                    got: i,
                    expected: self.len,
                });
            }

            let (xs, ys) = self.row(i).split_at(self.x_size);
            x.row_mut(r).assign(&ArrayView1::from(xs));
            y.row_mut(r).assign(&ArrayView1::from(ys));
        }

        Ok((x, y))
    }

    /// A random permutation of the row indices.
    pub fn shuffled_indices<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        indices.shuffle(rng);
        indices
    }

    /// Splits the dataset in two, the first one keeping `ratio` of the rows.
    pub fn split(self, ratio: f32) -> (Dataset, Dataset) {
        let at = ((self.len as f32 * ratio.clamp(0., 1.)) as usize).min(self.len);
        let width = self.x_size + self.y_size;
        let mut head = self.data;
        let tail = head.split_off(at * width);

        (
            Dataset {
                len: at,
                data: head,
                ..self
            },
            Dataset {
                len: self.len - at,
                data: tail,
                ..self
            },
        )
    }

    /// Keeps at most the first `rows` rows.
    pub fn truncate(mut self, rows: usize) -> Dataset {
        self.len = self.len.min(rows);
        self.data.truncate(self.len * (self.x_size + self.y_size));
        self
    }

    /// The rows that belong to `rank` when the dataset is split among `world_size`
    /// members, round robin.
    pub fn shard(&self, rank: usize, world_size: usize) -> Dataset {
        let world_size = world_size.max(1);
        let data = (rank..self.len)
            .step_by(world_size)
            .flat_map(|i| self.row(i).iter().copied())
            .collect::<Vec<_>>();

        Dataset {
            x_size: self.x_size,
            y_size: self.y_size,
            len: data.len() / (self.x_size + self.y_size),
            data,
        }
    }
}
