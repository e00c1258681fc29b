//! Job results: request and diff counters, the status-code histogram and the
//! diff log.
//!
//! All state lives behind one lock so that a diff record and the counters it
//! affects are updated together, and records from concurrent requests never
//! interleave in the log.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::forward::ForwardedResponse;

/// Histogram of experiment status code -> control status code -> occurrences.
pub type Codes = BTreeMap<i32, BTreeMap<i32, u64>>;

/// An append-only diff log.
///
/// Writing happens while the job runs; [`DiffSink::seal`] ends the write phase
/// and hands back a reader over everything written.
pub trait DiffSink: Write + Send {
    fn seal(self: Box<Self>) -> io::Result<Box<dyn Read + Send>>;
}

/// Diff log kept in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DiffSink for MemorySink {
    fn seal(self: Box<Self>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.buf)))
    }
}

/// Diff log backed by a local file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { path, writer })
    }
}

impl Write for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl DiffSink for FileSink {
    fn seal(self: Box<Self>) -> io::Result<Box<dyn Read + Send>> {
        let FileSink { path, writer } = *self;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        Ok(Box::new(File::open(path)?))
    }
}

/// Formats one diff log record.
pub fn format_diff(request: &str, control: &str, experiment: &str) -> String {
    format!(
        "=== diff ===\n{}\n---\n{}\n---\n{}\n============\n",
        request, control, experiment
    )
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultsSnapshot {
    pub requests: u64,
    pub diffs: u64,
    pub codes: Codes,
}

struct ResultsState {
    requests: u64,
    diffs: u64,
    codes: Codes,
    sink: Option<Box<dyn DiffSink>>,
}

/// The shared aggregate of one job run.
pub struct Results {
    state: Mutex<ResultsState>,
}

impl Results {
    /// Results for a load job: only the request count is used.
    pub fn for_load() -> Self {
        Self::with_sink(None)
    }

    /// Results for a correctness job writing diffs to `sink`.
    pub fn for_correctness(sink: Box<dyn DiffSink>) -> Self {
        Self::with_sink(Some(sink))
    }

    fn with_sink(sink: Option<Box<dyn DiffSink>>) -> Self {
        Self {
            state: Mutex::new(ResultsState {
                requests: 0,
                diffs: 0,
                codes: Codes::new(),
                sink,
            }),
        }
    }

    /// Counts a request that was forwarded (and, for correctness jobs, found
    /// equal).
    pub fn record_request(&self) {
        self.state.lock().unwrap().requests += 1;
    }

    /// Counts a request whose responses differed and appends its diff record.
    ///
    /// The record is written before any counter moves, so a failed write
    /// leaves the counters consistent with the log.
    pub fn record_diff(
        &self,
        request_dump: &str,
        control: &ForwardedResponse,
        experiment: &ForwardedResponse,
    ) -> io::Result<()> {
        let record = format_diff(request_dump, &control.dump, &experiment.dump);

        let mut state = self.state.lock().unwrap();
        match state.sink.as_mut() {
            Some(sink) => sink.write_all(record.as_bytes())?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "diff log is sealed or was never opened",
                ))
            }
        }

        state.requests += 1;
        state.diffs += 1;
        *state
            .codes
            .entry(experiment.status)
            .or_default()
            .entry(control.status)
            .or_insert(0) += 1;
        Ok(())
    }

    pub fn requests(&self) -> u64 {
        self.state.lock().unwrap().requests
    }

    pub fn diffs(&self) -> u64 {
        self.state.lock().unwrap().diffs
    }

    pub fn codes(&self) -> Codes {
        self.state.lock().unwrap().codes.clone()
    }

    pub fn snapshot(&self) -> ResultsSnapshot {
        let state = self.state.lock().unwrap();
        ResultsSnapshot {
            requests: state.requests,
            diffs: state.diffs,
            codes: state.codes.clone(),
        }
    }

    /// Ends the write phase of the diff log and returns a reader over it.
    ///
    /// Returns `Ok(None)` for load jobs or if the log was already sealed.
    /// Any later [`Results::record_diff`] fails.
    pub fn seal(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        let sink = self.state.lock().unwrap().sink.take();
        sink.map(|mut sink| {
            sink.flush()?;
            sink.seal()
        })
        .transpose()
    }
}
