use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use log::info;
use serde::Serialize;

use super::Phase;

/// Somewhere recorded metrics are delivered to.
///
/// Delivery is best effort: the reporter logs and drops a value whose
/// emission fails.
pub trait ReportSink: Send {
    fn emit(&mut self, phase: Phase, name: &str, value: f32, epoch: usize) -> io::Result<()>;
}

/// Emits every metric as a structured `info` log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&mut self, phase: Phase, name: &str, value: f32, epoch: usize) -> io::Result<()> {
        info!(phase = phase.as_str(), metric = name, value = value, epoch = epoch; "metric");
        Ok(())
    }
}

#[derive(Serialize)]
struct Record<'a> {
    epoch: usize,
    phase: Phase,
    name: &'a str,
    value: f32,
}

/// Writes one JSON object per metric and line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ReportSink for JsonLinesSink<W> {
    fn emit(&mut self, phase: Phase, name: &str, value: f32, epoch: usize) -> io::Result<()> {
        let record = Record {
            epoch,
            phase,
            name,
            value,
        };

        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
