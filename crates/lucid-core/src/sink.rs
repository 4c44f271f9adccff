//! Result observers and history sinks.
//!
//! Results are pushed to an explicit, ordered observer list after every
//! evaluation. Transition log entries go to a single [`HistorySink`].

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{LogEntry, RemEvaluationResult};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Result observers
// ============================================================================

/// Receives every evaluation result (cue actuator, UI layer).
pub trait ResultObserver: Send {
    fn on_result(&mut self, result: &RemEvaluationResult);
}

impl<F> ResultObserver for F
where
    F: FnMut(&RemEvaluationResult) + Send,
{
    fn on_result(&mut self, result: &RemEvaluationResult) {
        self(result)
    }
}

/// Forwards results over a bounded channel without blocking the
/// evaluation path. Results that do not fit are dropped and counted.
pub struct ChannelObserver {
    tx: Sender<RemEvaluationResult>,
    dropped: Arc<AtomicU64>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, Receiver<RemEvaluationResult>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Shared drop counter.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl ResultObserver for ChannelObserver {
    fn on_result(&mut self, result: &RemEvaluationResult) {
        match self.tx.try_send(result.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Result channel full, dropping evaluation");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Result channel disconnected");
            }
        }
    }
}

// ============================================================================
// History sinks
// ============================================================================

/// Persists transition log entries.
pub trait HistorySink: Send {
    fn record(&mut self, entry: &LogEntry) -> Result<(), SinkError>;
}

/// Discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistorySink;

impl HistorySink for NullHistorySink {
    fn record(&mut self, _entry: &LogEntry) -> Result<(), SinkError> {
        Ok(())
    }
}

/// In-memory sink; clones share the same entry list.
#[derive(Debug, Default, Clone)]
pub struct MemoryHistorySink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl HistorySink for MemoryHistorySink {
    fn record(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Append-only JSON-lines file, one [`LogEntry`] per line.
pub struct JsonlHistorySink {
    writer: BufWriter<File>,
}

impl JsonlHistorySink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Read back every entry of a JSON-lines history file.
    pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>, SinkError> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(SinkError::from))
            .collect()
    }
}

impl HistorySink for JsonlHistorySink {
    fn record(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
