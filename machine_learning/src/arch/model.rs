use std::sync::Arc;

use comms::ProcessGroup;
use ndarray::{Array2, ArrayView2};

use crate::{Precision, Result};

/// A differentiable model whose parameters live in one flat buffer.
///
/// The flat layout is what lets replicas be averaged and optimizers be run
/// without knowing anything about the model's structure.
pub trait Model: Send {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// The width of the inputs the model takes.
    fn input_dim(&self) -> usize;

    /// The width of the outputs the model produces.
    fn output_dim(&self) -> usize;

    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    /// Switches between training and evaluation behavior.
    fn set_training(&mut self, training: bool);

    /// Makes a forward pass through the model, keeping what `backward` needs.
    ///
    /// # Arguments
    /// * `x` - A `(batch, input_dim)` input.
    /// * `precision` - The precision activations are computed at.
    ///
    /// # Returns
    /// The `(batch, output_dim)` prediction.
    fn forward(&mut self, x: ArrayView2<f32>, precision: Precision) -> Result<Array2<f32>>;

    /// Backpropagates `d`, the derivative of the loss with respect to the last
    /// `forward` output.
    ///
    /// # Arguments
    /// * `d` - The delta of the output.
    /// * `grad` - A `size()` long buffer, overwritten with the gradient.
    fn backward(&mut self, d: Array2<f32>, grad: &mut [f32]) -> Result<()>;

    /// Makes every normalization layer reduce its statistics over `group`, or
    /// stop doing so when `None`.
    ///
    /// # Returns
    /// The amount of layers affected.
    fn sync_norm(&mut self, _group: Option<Arc<dyn ProcessGroup>>) -> usize {
        0
    }
}
