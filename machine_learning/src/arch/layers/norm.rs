use std::sync::Arc;

use comms::ProcessGroup;
use ndarray::prelude::*;

use crate::{MlErr, Precision, Result};

const EPS: f32 = 1e-5;
const MOMENTUM: f32 = 0.1;

/// Batch normalization without affine parameters.
///
/// While training, every feature is normalized with the statistics of the
/// current batch, and running statistics are tracked for evaluation. When a
/// process group is attached the batch statistics are computed over the
/// union of every member's batch, so all members normalize identically.
#[derive(Clone)]
pub struct Norm {
    dim: usize,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    group: Option<Arc<dyn ProcessGroup>>,

    // Forward metadata
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
    count: f32,
    batch_stats: bool,
}

impl Norm {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            running_mean: Array1::zeros(dim),
            running_var: Array1::ones(dim),
            group: None,
            x_hat: Array2::zeros((0, dim)),
            inv_std: Array1::ones(dim),
            count: 0.,
            batch_stats: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Attaches or detaches the group batch statistics are reduced over.
    pub fn set_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) {
        self.group = group;
    }

    pub fn is_synced(&self) -> bool {
        self.group.is_some()
    }

    pub fn running_mean(&self) -> ArrayView1<'_, f32> {
        self.running_mean.view()
    }

    pub fn running_var(&self) -> ArrayView1<'_, f32> {
        self.running_var.view()
    }

    /// Normalizes `x`, with batch statistics when `training` and running
    /// statistics otherwise.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` on a wrong input width, `MlErr::InvalidInput` if the
    /// (possibly global) batch is empty, and `MlErr::Comms` if the statistics
    /// could not be reduced.
    pub fn forward(
        &mut self,
        x: ArrayView2<f32>,
        precision: Precision,
        training: bool,
    ) -> Result<Array2<f32>> {
        if x.ncols() != self.dim {
            return Err(MlErr::SizeMismatch {
                what: "norm layer input",
                got: x.ncols(),
                expected: self.dim,
            });
        }

        self.batch_stats = training;

        if !training {
            self.inv_std = self.running_var.mapv(|v| 1. / (v + EPS).sqrt());
            self.count = x.nrows() as f32;
            let mut out = (&x - &self.running_mean) * &self.inv_std;
            precision.round_inplace(&mut out);
            self.x_hat = out.clone();
            return Ok(out);
        }

        let dim = self.dim;
        let mut stats = Vec::with_capacity(2 * dim + 1);
        stats.extend(x.sum_axis(Axis(0)));
        stats.extend(x.mapv(|v| v * v).sum_axis(Axis(0)));
        stats.push(x.nrows() as f32);

        if let Some(group) = &self.group {
            group.all_reduce_sum(&mut stats)?;
        }

        let n = stats[2 * dim];
        if n < 1. {
            return Err(MlErr::InvalidInput("normalizing an empty batch"));
        }

        let mean: Array1<f32> = stats[..dim].iter().map(|s| s / n).collect();
        let var: Array1<f32> = stats[dim..2 * dim]
            .iter()
            .zip(&mean)
            .map(|(sq, m)| (sq / n - m * m).max(0.))
            .collect();

        self.inv_std = var.mapv(|v| 1. / (v + EPS).sqrt());
        self.count = n;
        self.x_hat = (&x - &mean) * &self.inv_std;
        precision.round_inplace(&mut self.x_hat);

        let unbiased = if n > 1. { n / (n - 1.) } else { 1. };
        self.running_mean = &self.running_mean * (1. - MOMENTUM) + &mean * MOMENTUM;
        self.running_var = &self.running_var * (1. - MOMENTUM) + &var * (MOMENTUM * unbiased);

        Ok(self.x_hat.clone())
    }

    /// Propagates `d` back through the normalization. This layer has no parameters.
    pub fn backward(&mut self, d: Array2<f32>) -> Result<Array2<f32>> {
        if d.dim() != self.x_hat.dim() {
            return Err(MlErr::SizeMismatch {
                what: "norm layer delta",
                got: d.len(),
                expected: self.x_hat.len(),
            });
        }

        if !self.batch_stats {
            return Ok(d * &self.inv_std);
        }

        let dim = self.dim;
        let mut stats = Vec::with_capacity(2 * dim);
        stats.extend(d.sum_axis(Axis(0)));
        stats.extend((&d * &self.x_hat).sum_axis(Axis(0)));

        if let Some(group) = &self.group {
            group.all_reduce_sum(&mut stats)?;
        }

        let n = self.count;
        let sum_d = ArrayView1::from(&stats[..dim]);
        let sum_d_xhat = ArrayView1::from(&stats[dim..]);
        let scale = &self.inv_std / n;

        Ok((d * n - &sum_d - &self.x_hat * &sum_d_xhat) * &scale)
    }
}
