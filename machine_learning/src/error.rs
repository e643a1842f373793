use std::{
    error::Error,
    fmt::{self, Display},
};

use comms::CommsErr;
use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidShape(ShapeError),
    InvalidInput(&'static str),
    Comms(CommsErr),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "there's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::InvalidShape(e) => write!(f, "invalid shape: {e}"),
            MlErr::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            MlErr::Comms(e) => write!(f, "collective failed: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::InvalidShape(e) => Some(e),
            MlErr::Comms(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::InvalidShape(value)
    }
}

impl From<CommsErr> for MlErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}
