use std::sync::Arc;

use comms::ProcessGroup;
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::{Model, layers::Layer};
use crate::{MlErr, Precision, Result};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
#[derive(Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
    params: Vec<f32>,
    training: bool,
}

impl Sequential {
    /// Creates a new `Sequential` with every parameter set to zero.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if a layer's input does not match the previous layer's output,
    /// `MlErr::InvalidInput` if there are no layers.
    pub fn new<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Layer>,
    {
        let layers: Vec<Layer> = layers.into_iter().collect();
        if layers.is_empty() {
            return Err(MlErr::InvalidInput("a sequential needs at least one layer"));
        }

        for pair in layers.windows(2) {
            if pair[0].output_dim() != pair[1].input_dim() {
                return Err(MlErr::SizeMismatch {
                    what: "consecutive layers",
                    got: pair[1].input_dim(),
                    expected: pair[0].output_dim(),
                });
            }
        }

        let size = layers.iter().map(Layer::size).sum();

        Ok(Self {
            layers,
            params: vec![0.; size],
            training: true,
        })
    }

    /// Replaces the parameters of the model.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `params` is not `size()` long.
    pub fn with_params(mut self, params: Vec<f32>) -> Result<Self> {
        if params.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameters",
                got: params.len(),
                expected: self.params.len(),
            });
        }

        self.params = params;
        Ok(self)
    }

    /// Initializes the weights with Xavier uniform initialization and the biases with zeros.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    pub fn init_params<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let mut offset = 0;

        for layer in &self.layers {
            let size = layer.size();
            let params = &mut self.params[offset..offset + size];
            offset += size;

            let Layer::Dense(dense) = layer else {
                continue;
            };

            let (fan_in, fan_out) = dense.dim();
            let range = (6. / (fan_in + fan_out) as f32).sqrt();
            let dist = Uniform::new_inclusive(-range, range)
                .map_err(|_| MlErr::InvalidInput("invalid xavier range"))?;

            let (weights, biases) = params.split_at_mut(dense.weights_len());
            weights.iter_mut().for_each(|w| *w = dist.sample(rng));
            biases.fill(0.);
        }

        Ok(())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

impl Model for Sequential {
    fn size(&self) -> usize {
        self.params.len()
    }

    fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_dim)
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Layer::output_dim)
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn forward(&mut self, x: ArrayView2<f32>, precision: Precision) -> Result<Array2<f32>> {
        let mut offset = 0;
        let mut out = x.to_owned();

        for layer in self.layers.iter_mut() {
            let size = layer.size();
            out = layer.forward(
                &self.params[offset..offset + size],
                out.view(),
                precision,
                self.training,
            )?;
            offset += size;
        }

        Ok(out)
    }

    fn backward(&mut self, mut d: Array2<f32>, grad: &mut [f32]) -> Result<()> {
        if grad.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "gradient buffer",
                got: grad.len(),
                expected: self.params.len(),
            });
        }

        let mut end = self.params.len();

        for layer in self.layers.iter_mut().rev() {
            let start = end - layer.size();
            d = layer.backward(&self.params[start..end], &mut grad[start..end], d)?;
            end = start;
        }

        Ok(())
    }

    fn sync_norm(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> usize {
        let mut synced = 0;

        for layer in self.layers.iter_mut() {
            if let Layer::Norm(norm) = layer {
                norm.set_group(group.clone());
                synced += 1;
            }
        }

        synced
    }
}
