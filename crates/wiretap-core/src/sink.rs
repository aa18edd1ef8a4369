//! Output sinks for captured traffic.
//!
//! A sink receives fully formatted records. Each [`OutputSink::emit`] call
//! is written as one unit, so a record (even a multi-line header dump) is
//! never interleaved with records from other sessions.

use std::io::{self, Write};

use chrono::Local;
use parking_lot::Mutex;

/// Append-only destination for formatted records.
pub trait OutputSink: Send + Sync {
    /// Writes one record. Must be atomic with respect to other calls.
    fn emit(&self, record: &str);
}

/// Timestamp prefix, in the style of a classic log line.
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Sink writing records as lines to any [`Write`] implementation.
///
/// The writer sits behind a single mutex; this is the only lock on the
/// request path.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
    timestamps: bool,
}

impl<W: Write + Send> WriterSink<W> {
    /// Creates a sink that prefixes records with a local timestamp.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            timestamps: true,
        }
    }

    /// Enables or disables the timestamp prefix.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn render(&self, record: &str) -> String {
        let mut line = String::with_capacity(record.len() + 21);
        if self.timestamps {
            line.push_str(&Local::now().format(TIMESTAMP_FORMAT).to_string());
            line.push(' ');
        }
        line.push_str(record);
        line.push('\n');
        line
    }
}

impl WriterSink<io::Stdout> {
    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn emit(&self, record: &str) {
        let line = self.render(record);

        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
            tracing::warn!("Failed to write output record: {}", e);
        }
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records emitted so far, in emission order.
    pub fn records(&self) -> Vec<String> {
        self.records.lock().clone()
    }

    /// Number of records emitted so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was emitted yet.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl OutputSink for MemorySink {
    fn emit(&self, record: &str) {
        self.records.lock().push(record.to_string());
    }
}
