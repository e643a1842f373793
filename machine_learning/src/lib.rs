pub mod arch;
pub mod dataset;
pub mod error;
pub mod optimization;
mod precision;

pub use error::{MlErr, Result};
pub use precision::Precision;
