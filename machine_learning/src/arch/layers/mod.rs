mod dense;
mod layer;
mod norm;

pub use dense::Dense;
pub use layer::Layer;
pub use norm::Norm;
