mod phase;
mod reporter;
mod sink;

pub use phase::Phase;
pub use reporter::MetricReporter;
pub use sink::{JsonLinesSink, LogSink, ReportSink};
