use std::{collections::BTreeMap, iter::Copied, slice};

use log::warn;

use super::{Phase, ReportSink};
use crate::error::ReportErr;

/// Per epoch metric series, keyed by phase and metric name.
///
/// Every series is append only: its first value belongs to epoch 0 and each
/// next value to the epoch right after the last one. Recorded values are also
/// forwarded to the attached sinks while emitting is on.
pub struct MetricReporter {
    series: BTreeMap<(Phase, String), Vec<f32>>,
    sinks: Vec<Box<dyn ReportSink>>,
    emitting: bool,
}

impl Default for MetricReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricReporter {
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
            sinks: Vec::new(),
            emitting: true,
        }
    }

    pub fn with_sink<S: ReportSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    /// Turns forwarding to the sinks on or off. Values are recorded either way.
    pub fn set_emitting(&mut self, emitting: bool) {
        self.emitting = emitting;
    }

    /// Appends `value` to the `(phase, name)` series.
    ///
    /// # Arguments
    /// * `phase` - The pass the value was measured on.
    /// * `name` - The metric name.
    /// * `value` - The aggregate value of the epoch.
    /// * `epoch` - The epoch the value belongs to.
    ///
    /// # Errors
    /// `ReportErr::OutOfOrder` unless `epoch` is exactly the next epoch of the
    /// series. Nothing is recorded nor emitted in that case.
    pub fn record(
        &mut self,
        phase: Phase,
        name: &str,
        value: f32,
        epoch: usize,
    ) -> Result<(), ReportErr> {
        let values = self.series.entry((phase, name.to_string())).or_default();

        if epoch != values.len() {
            return Err(ReportErr::OutOfOrder {
                phase,
                name: name.to_string(),
                expected: values.len(),
                got: epoch,
            });
        }

        values.push(value);

        if self.emitting {
            for sink in self.sinks.iter_mut() {
                if let Err(e) = sink.emit(phase, name, value, epoch) {
                    warn!(phase = phase.as_str(), metric = name, epoch = epoch; "dropped metric: {e}");
                }
            }
        }

        Ok(())
    }

    /// The recorded values of a series, in epoch order. Empty for unknown series.
    ///
    /// The iterator borrows the reporter, so it can be requested again at any
    /// time to start over.
    pub fn history(&self, phase: Phase, name: &str) -> Copied<slice::Iter<'_, f32>> {
        // BTreeMap needs an owned key to look up tuples.
        self.series
            .get(&(phase, name.to_string()))
            .map_or(&[][..], Vec::as_slice)
            .iter()
            .copied()
    }

    /// Like `history`, keyed as `<name>/<phase>`, e.g. `accuracy/test`.
    ///
    /// # Errors
    /// `ReportErr::InvalidKey` if the key has no known phase suffix.
    pub fn history_key(&self, key: &str) -> Result<Copied<slice::Iter<'_, f32>>, ReportErr> {
        let (name, phase) = key
            .rsplit_once('/')
            .ok_or_else(|| ReportErr::InvalidKey(key.to_string()))?;
        let phase: Phase = phase
            .parse()
            .map_err(|_| ReportErr::InvalidKey(key.to_string()))?;

        Ok(self.history(phase, name))
    }

    pub fn last(&self, phase: Phase, name: &str) -> Option<f32> {
        self.history(phase, name).last()
    }

    /// The largest recorded value of a series, ignoring NaNs.
    pub fn max(&self, phase: Phase, name: &str) -> Option<f32> {
        self.history(phase, name)
            .filter(|v| !v.is_nan())
            .reduce(f32::max)
    }

    /// The names of every series recorded under `phase`.
    pub fn names(&self, phase: Phase) -> impl Iterator<Item = &str> {
        self.series
            .keys()
            .filter(move |(p, _)| *p == phase)
            .map(|(_, name)| name.as_str())
    }
}
