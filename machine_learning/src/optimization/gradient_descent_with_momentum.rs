use super::{Optimizer, check_sizes};
use crate::Result;

/// Gradient descent with heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay: 0.,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Adds `weight_decay * param` to every gradient component.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params, Some(self.velocity.len()))?;

        let lr = self.learning_rate;
        let mu = self.momentum;
        let wd = self.weight_decay;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g + wd * *p;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates_across_steps() {
        let mut opt = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut params = [0.];

        opt.update_params(&[1.], &mut params).unwrap();
        assert_eq!(params, [-1.]);
        opt.update_params(&[1.], &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut opt = GradientDescentWithMomentum::new(1, 0.1, 0.).with_weight_decay(1.);
        let mut params = [10.];
        opt.update_params(&[0.], &mut params).unwrap();
        assert_eq!(params, [9.]);
    }

    #[test]
    fn rejects_a_different_model() {
        let mut opt = GradientDescentWithMomentum::new(2, 0.1, 0.9);
        assert!(opt.update_params(&[0.; 3], &mut [0.; 3]).is_err());
    }
}
