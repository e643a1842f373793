use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;

/// Softmax cross entropy over raw logits, against one-hot (or soft) targets.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }
}

/// Row-wise log-softmax, shifted by each row's maximum.
fn log_softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();

    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let lse = max + row.mapv(|v| (v - max).exp()).sum().ln();
        row.mapv_inplace(|v| v - lse);
    }

    out
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let n = y_pred.nrows().max(1) as f32;
        -(log_softmax(y_pred) * &y).sum() / n
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let n = y_pred.nrows().max(1) as f32;
        (log_softmax(y_pred).mapv_into(f32::exp) - &y) / n
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_log_classes() {
        let ce = CrossEntropy::new();
        let loss = ce.loss(
            array![[0., 0., 0., 0.]].view(),
            array![[0., 1., 0., 0.]].view(),
        );

        assert!((loss - 4_f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn large_logits_do_not_overflow() {
        let ce = CrossEntropy::new();
        let loss = ce.loss(array![[1000., 0.]].view(), array![[1., 0.]].view());
        assert!(loss.is_finite());
        assert!(loss < 1e-6);
    }

    #[test]
    fn gradient_is_softmax_minus_target() {
        let ce = CrossEntropy::new();
        let d = ce.loss_prime(
            array![[0., 0.], [0., 0.]].view(),
            array![[1., 0.], [0., 1.]].view(),
        );

        assert_eq!(d, array![[-0.25, 0.25], [0.25, -0.25]]);
    }
}
