mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;

use crate::{MlErr, Result};

fn check_sizes(grad: &[f32], params: &[f32], state: Option<usize>) -> Result<()> {
    if grad.len() != params.len() {
        return Err(MlErr::SizeMismatch {
            what: "gradient and parameters",
            got: grad.len(),
            expected: params.len(),
        });
    }

    match state {
        Some(len) if len != params.len() => Err(MlErr::SizeMismatch {
            what: "optimizer state and parameters",
            got: params.len(),
            expected: len,
        }),
        _ => Ok(()),
    }
}
