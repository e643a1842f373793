use ndarray::{Array2, ArrayView2};

use super::{Dense, Norm};
use crate::{Precision, Result, arch::activations::ActFn};

#[derive(Clone)]
pub enum Layer {
    Dense(Dense),
    Norm(Norm),
}
use Layer::*;

impl Layer {
    pub fn dense(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self::Dense(Dense::new(dim, act_fn))
    }

    pub fn norm(dim: usize) -> Self {
        Self::Norm(Norm::new(dim))
    }

    /// The amount of parameters of the layer.
    pub fn size(&self) -> usize {
        match self {
            Dense(l) => l.size(),
            Norm(_) => 0,
        }
    }

    pub fn input_dim(&self) -> usize {
        match self {
            Dense(l) => l.dim().0,
            Norm(l) => l.dim(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Dense(l) => l.dim().1,
            Norm(l) => l.dim(),
        }
    }

    pub fn forward(
        &mut self,
        params: &[f32],
        x: ArrayView2<f32>,
        precision: Precision,
        training: bool,
    ) -> Result<Array2<f32>> {
        match self {
            Dense(l) => l.forward(params, x, precision),
            Norm(l) => l.forward(x, precision, training),
        }
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Dense(l) => l.backward(params, grad, d),
            Norm(l) => l.backward(d),
        }
    }
}
