pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod reporting;
pub mod scaling;
pub mod schedule;
pub mod trainer;

pub use config::{DistributedConfig, LossScaleConfig, SessionConfig};
pub use data::{Batch, DataLoader, DataProducer, Loaded};
pub use distributed::{DistributedContext, InitOptions};
pub use error::{OrchestraErr, Result, StepFault};
pub use reporting::{MetricReporter, Phase};
pub use scaling::ScalingPolicy;
pub use schedule::{Policy, ScheduleController};
pub use trainer::{Trainer, TrainerParts};
