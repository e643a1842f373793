use std::{error::Error, fmt, io};

use comms::CommsErr;
use machine_learning::MlErr;

use crate::reporting::Phase;

/// The result type used across the orchestration layer.
pub type Result<T> = std::result::Result<T, OrchestraErr>;

/// Why a process could not join its distributed group.
#[derive(Debug)]
pub enum InitErr {
    /// This process already joined a group.
    AlreadyInitialized,
    /// A launcher variable is missing or malformed.
    InvalidEnv { var: &'static str, value: String },
    /// The rendezvous itself failed.
    Rendezvous(CommsErr),
}

/// Why a reporter refused a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportErr {
    OutOfOrder {
        phase: Phase,
        name: String,
        expected: usize,
        got: usize,
    },
    /// A history key that is not `<name>/<phase>`.
    InvalidKey(String),
}

/// What went wrong on a single batch.
#[derive(Debug)]
pub enum StepFault {
    MalformedBatch(String),
    NonFiniteLoss(f32),
    NonFiniteGradient,
    Model(MlErr),
    /// The producer could not assemble the batch.
    Data(MlErr),
}

/// All errors that can occur while orchestrating a training session.
#[derive(Debug)]
pub enum OrchestraErr {
    /// Invalid or mutually exclusive settings, caught before acquiring anything.
    Configuration(String),
    /// The distributed context could not be established.
    Initialization(InitErr),
    /// A batch could not be trained or evaluated on.
    TrainingStep {
        epoch: usize,
        batch: usize,
        fault: StepFault,
    },
    /// A collective failed mid-session.
    Communication(CommsErr),
    Report(ReportErr),
    Io(io::Error),
}

impl fmt::Display for InitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => {
                write!(f, "the distributed context was already initialized")
            }
            Self::InvalidEnv { var, value } => write!(f, "invalid {var}: {value:?}"),
            Self::Rendezvous(e) => write!(f, "rendezvous failed: {e}"),
        }
    }
}

impl fmt::Display for ReportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder {
                phase,
                name,
                expected,
                got,
            } => write!(
                f,
                "{name}/{phase} recorded for epoch {got}, expected epoch {expected}"
            ),
            Self::InvalidKey(key) => write!(f, "invalid metric key {key:?}"),
        }
    }
}

impl fmt::Display for StepFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedBatch(msg) => write!(f, "malformed batch: {msg}"),
            Self::NonFiniteLoss(loss) => write!(f, "non finite loss ({loss})"),
            Self::NonFiniteGradient => write!(f, "non finite gradient"),
            Self::Model(e) => write!(f, "model error: {e}"),
            Self::Data(e) => write!(f, "could not load batch: {e}"),
        }
    }
}

impl fmt::Display for OrchestraErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Initialization(e) => write!(f, "initialization failed: {e}"),
            Self::TrainingStep {
                epoch,
                batch,
                fault,
            } => write!(f, "epoch {epoch}, batch {batch}: {fault}"),
            Self::Communication(e) => write!(f, "communication failed: {e}"),
            Self::Report(e) => write!(f, "report error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for InitErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rendezvous(e) => Some(e),
            _ => None,
        }
    }
}

impl Error for ReportErr {}

impl Error for StepFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Model(e) | Self::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl Error for OrchestraErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Initialization(e) => Some(e),
            Self::TrainingStep { fault, .. } => Some(fault),
            Self::Communication(e) => Some(e),
            Self::Report(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Configuration(_) => None,
        }
    }
}

impl From<InitErr> for OrchestraErr {
    fn from(e: InitErr) -> Self {
        Self::Initialization(e)
    }
}

impl From<ReportErr> for OrchestraErr {
    fn from(e: ReportErr) -> Self {
        Self::Report(e)
    }
}

impl From<CommsErr> for OrchestraErr {
    fn from(e: CommsErr) -> Self {
        Self::Communication(e)
    }
}

impl From<io::Error> for OrchestraErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl OrchestraErr {
    /// Attaches the failing batch to a model error.
    ///
    /// Collective failures inside the model (synchronized normalization) are
    /// communication errors, not step faults.
    pub(crate) fn from_model(epoch: usize, batch: usize, e: MlErr) -> Self {
        match e {
            MlErr::Comms(e) => Self::Communication(e),
            e => Self::TrainingStep {
                epoch,
                batch,
                fault: StepFault::Model(e),
            },
        }
    }
}
