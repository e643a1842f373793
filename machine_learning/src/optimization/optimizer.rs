use crate::Result;

/// An optimization algorithm over a flat parameter buffer.
pub trait Optimizer: Send {
    /// Takes one step, updating `params` with `grad`.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `grad`, `params` and the optimizer's state disagree in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    fn learning_rate(&self) -> f32;

    /// Overrides the step size; schedules call this between epochs.
    fn set_learning_rate(&mut self, learning_rate: f32);
}
