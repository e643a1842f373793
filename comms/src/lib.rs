mod backend;
mod error;
mod group;
mod local;
mod rendezvous;

pub use backend::Backend;
pub use error::{CommsErr, Result};
pub use group::ProcessGroup;
pub use local::{DEFAULT_TIMEOUT, LocalGroup};
pub use rendezvous::{InitMethod, connect};
