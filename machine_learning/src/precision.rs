use half::f16;
use ndarray::{ArrayBase, DataMut, Dimension};

/// The numeric precision a forward pass runs at.
///
/// Parameters and gradients are always kept in `f32`; `Half` only rounds the
/// activations (and the weights they are computed with) through `f16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl Precision {
    /// Rounds a single value to this precision.
    pub fn round(self, x: f32) -> f32 {
        match self {
            Precision::Full => x,
            Precision::Half => f16::from_f32(x).to_f32(),
        }
    }

    /// Rounds every element of `a` in place.
    pub fn round_inplace<S, D>(self, a: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        if self == Precision::Half {
            a.mapv_inplace(|x| f16::from_f32(x).to_f32());
        }
    }

    /// Whether `x` can not be represented at this precision.
    pub fn overflows(self, x: f32) -> bool {
        match self {
            Precision::Full => !x.is_finite(),
            Precision::Half => !f16::from_f32(x).is_finite(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn full_precision_is_identity() {
        let x = 1.0 / 3.0;
        assert_eq!(Precision::Full.round(x), x);
        assert!(!Precision::Full.overflows(1e30));
        assert!(Precision::Full.overflows(f32::NAN));
    }

    #[test]
    fn half_precision_rounds_and_overflows() {
        let x = 1.0 / 3.0;
        let r = Precision::Half.round(x);
        assert_ne!(r, x);
        assert!((r - x).abs() < 1e-3);

        assert!(Precision::Half.overflows(70_000.0));
        assert!(!Precision::Half.overflows(60_000.0));

        let mut a = array![[0.1_f32, 1e6]];
        Precision::Half.round_inplace(&mut a);
        assert!(a[[0, 1]].is_infinite());
    }
}
