use std::{error::Error, fmt, time::Duration};

use crate::Backend;

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// Process group failures.
#[derive(Debug, Clone, PartialEq)]
pub enum CommsErr {
    /// A collective did not complete within the group's timeout.
    Timeout { op: &'static str, after: Duration },
    /// Another member left the group while a collective was in flight.
    PeerLost { op: &'static str },
    /// The contributed buffer does not match the buffer of the current round.
    SizeMismatch { got: usize, expected: usize },
    /// The rank is out of bounds for the world size.
    InvalidRank { rank: usize, world_size: usize },
    /// The rank already joined the named group.
    AlreadyJoined { name: String, rank: usize },
    /// Members disagree on the size of the named group.
    WorldSizeMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    /// The init method's scheme is not understood by this build.
    UnsupportedInitMethod(String),
    /// The requested backend cannot run on this machine.
    BackendUnavailable(Backend),
}

impl fmt::Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::Timeout { op, after } => {
                write!(f, "{op} timed out after {}ms", after.as_millis())
            }
            CommsErr::PeerLost { op } => write!(f, "a peer left the group during {op}"),
            CommsErr::SizeMismatch { got, expected } => {
                write!(f, "buffer size mismatch: got {got}, expected {expected}")
            }
            CommsErr::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is out of bounds for world size {world_size}")
            }
            CommsErr::AlreadyJoined { name, rank } => {
                write!(f, "rank {rank} already joined group {name:?}")
            }
            CommsErr::WorldSizeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "group {name:?} has world size {expected}, but a member asked for {got}"
            ),
            CommsErr::UnsupportedInitMethod(method) => {
                write!(f, "unsupported init method {method:?}")
            }
            CommsErr::BackendUnavailable(backend) => {
                write!(f, "backend {backend} is not available on this machine")
            }
        }
    }
}

impl Error for CommsErr {}
