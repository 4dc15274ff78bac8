//! Global append-only event log.
//!
//! A single JSONL file holds every event across all aggregate instances.
//! Sequence numbers are assigned under an internal lock at append time, so
//! the order of sequence numbers is exactly commit order. Consumers replay
//! from any offset with [`EventLog::read_from`]; aggregates rebuild their
//! state from [`EventLog::read_stream`]. A `watch` channel publishes the
//! head position so long-lived consumers can sleep between appends instead
//! of polling.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// File name of the log within the base directory.
const LOG_FILE: &str = "events.jsonl";

/// An event accepted by an aggregate but not yet committed to the log.
///
/// The log stamps the sequence number and timestamp at append time.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Source aggregate type (e.g. `"document"`).
    pub aggregate_type: String,
    /// Source aggregate instance identifier.
    pub instance_id: String,
    /// Event tag, the `"type"` half of the adjacently tagged domain event.
    pub event_type: String,
    /// Event payload, the `"data"` half. `Null` for fieldless variants.
    pub payload: Value,
    /// Correlation ID of the originating request, if any.
    pub correlation_id: Option<String>,
    /// Identity of whoever issued the originating command.
    pub actor: Option<String>,
}

/// A committed event, as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recorded {
    /// Global commit-order position, starting at 1.
    pub sequence: u64,
    /// Source aggregate type.
    pub aggregate_type: String,
    /// Source aggregate instance identifier.
    pub instance_id: String,
    /// Event tag.
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
    /// Correlation ID of the originating request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Identity of whoever issued the originating command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Commit timestamp.
    pub recorded_at: DateTime<Utc>,
}

struct LogInner {
    file: File,
    path: PathBuf,
    next_sequence: u64,
}

/// Handle to the shared event log. `Clone` is cheap; all clones append to
/// and read from the same file under the same lock.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
    head: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("head", &*self.head.borrow())
            .finish()
    }
}

impl EventLog {
    /// Open (or create) the log in `dir`.
    ///
    /// Scans the existing file to recover the head position, so reopening
    /// continues the sequence without gaps or reuse.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory or file cannot be created, or
    /// with [`io::ErrorKind::InvalidData`] if an existing line fails to
    /// parse.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let mut head = 0u64;
        match File::open(&path) {
            Ok(existing) => {
                for line in BufReader::new(existing).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: Recorded = serde_json::from_str(&line).map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("corrupt log line after sequence {head}: {e}"),
                        )
                    })?;
                    head = record.sequence;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (head_tx, _) = watch::channel(head);

        tracing::debug!(path = %path.display(), head, "event log opened");

        Ok(Self {
            inner: Arc::new(Mutex::new(LogInner {
                file,
                path,
                next_sequence: head + 1,
            })),
            head: Arc::new(head_tx),
        })
    }

    /// Append a batch of events, assigning consecutive sequence numbers.
    ///
    /// The batch is written as one locked section, so events from a single
    /// command are contiguous in the log. The head watch channel is updated
    /// after the write completes.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if serialization or the file write fails.
    pub fn append(&self, batch: Vec<Pending>) -> io::Result<Vec<Recorded>> {
        let mut inner = self.lock();
        let mut recorded = Vec::with_capacity(batch.len());
        for pending in batch {
            let record = Recorded {
                sequence: inner.next_sequence,
                aggregate_type: pending.aggregate_type,
                instance_id: pending.instance_id,
                event_type: pending.event_type,
                payload: pending.payload,
                correlation_id: pending.correlation_id,
                actor: pending.actor,
                recorded_at: Utc::now(),
            };
            let line = serde_json::to_string(&record).map_err(io::Error::other)?;
            writeln!(inner.file, "{line}")?;
            inner.next_sequence += 1;
            recorded.push(record);
        }
        inner.file.flush()?;
        drop(inner);

        if let Some(last) = recorded.last() {
            self.head.send_replace(last.sequence);
        }
        Ok(recorded)
    }

    /// Read every event with a sequence number strictly greater than
    /// `after`, in commit order.
    pub fn read_from(&self, after: u64) -> io::Result<Vec<Recorded>> {
        let inner = self.lock();
        read_matching(&inner.path, |r| r.sequence > after)
    }

    /// Read every event belonging to one aggregate instance, in commit order.
    pub fn read_stream(&self, aggregate_type: &str, instance_id: &str) -> io::Result<Vec<Recorded>> {
        let inner = self.lock();
        read_matching(&inner.path, |r| {
            r.aggregate_type == aggregate_type && r.instance_id == instance_id
        })
    }

    /// Current head position (sequence of the last committed event, 0 if
    /// the log is empty).
    pub fn head(&self) -> u64 {
        *self.head.borrow()
    }

    /// Subscribe to head-position updates.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        // A poisoned lock still holds valid file state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scan the log file and collect records matching `filter`.
fn read_matching(path: &Path, filter: impl Fn(&Recorded) -> bool) -> io::Result<Vec<Recorded>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Recorded = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if filter(&record) {
            out.push(record);
        }
    }
    Ok(out)
}
