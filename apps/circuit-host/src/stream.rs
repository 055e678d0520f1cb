//! Reassembly of inbound byte streams that the peer sends as sequenced chunks.
//!
//! Each stream accepts chunks strictly in order starting at zero. Any protocol
//! violation, a peer-supplied error, or inactivity past the chunk timeout puts
//! the stream into a latched failed state that every reader observes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CircuitError;
use crate::fault::FaultReporter;
use crate::metrics::STREAM_FAILURES;

pub const DEFAULT_MAX_CHUNK_BYTES: usize = 32 * 1024;
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_STREAM_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("a chunk cannot be empty")]
    EmptyChunk,
    #[error("chunk exceeded permitted length ({len} > {max} bytes)")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("declared length exceeded ({received} > {declared} bytes)")]
    DeclaredLengthExceeded { received: u64, declared: u64 },
    #[error("out of sequence chunk: expected {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },
    #[error("Did not receive any data in the allotted time")]
    TimedOut,
    #[error("client reported an error: {0}")]
    Client(String),
    #[error("circuit disposed")]
    Disposed,
}

impl StreamError {
    pub fn reason(&self) -> &'static str {
        match self {
            StreamError::EmptyChunk => "empty_chunk",
            StreamError::ChunkTooLarge { .. } => "chunk_too_large",
            StreamError::DeclaredLengthExceeded { .. } => "length_exceeded",
            StreamError::OutOfSequence { .. } => "out_of_sequence",
            StreamError::TimedOut => "timed_out",
            StreamError::Client(_) => "client",
            StreamError::Disposed => "disposed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub max_chunk_bytes: usize,
    pub max_stream_bytes: u64,
    pub chunk_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Receiving {
        next_seq: u64,
        received: u64,
        total_length: u64,
    },
    Completed,
    Failed(StreamError),
}

enum ChunkOutcome {
    Accepted,
    Completed,
    Failed(StreamError),
    /// The stream had already finished; nothing changed.
    Rejected,
}

struct StreamInner {
    total_length: u64,
    received: u64,
    next_seq: u64,
    deadline: Instant,
    timeout: Duration,
    chunks: VecDeque<Bytes>,
    terminal: Option<Result<(), StreamError>>,
}

struct StreamShared {
    id: u64,
    inner: Mutex<StreamInner>,
    changed: watch::Sender<u64>,
}

impl StreamShared {
    fn bump(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn accept(
        &self,
        seq: u64,
        bytes: Option<Bytes>,
        error: Option<String>,
        max_chunk_bytes: usize,
    ) -> ChunkOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return ChunkOutcome::Rejected;
            }
            match validate(&inner, seq, bytes, error, max_chunk_bytes) {
                Err(err) => {
                    inner.terminal = Some(Err(err.clone()));
                    inner.chunks.clear();
                    ChunkOutcome::Failed(err)
                }
                Ok(chunk) => {
                    inner.received += chunk.len() as u64;
                    inner.next_seq += 1;
                    inner.deadline = Instant::now() + inner.timeout;
                    inner.chunks.push_back(chunk);
                    if inner.received == inner.total_length {
                        inner.terminal = Some(Ok(()));
                        ChunkOutcome::Completed
                    } else {
                        ChunkOutcome::Accepted
                    }
                }
            }
        };
        self.bump();
        outcome
    }

    fn fail(&self, error: StreamError) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return false;
            }
            inner.terminal = Some(Err(error));
            inner.chunks.clear();
        }
        self.bump();
        true
    }

    fn status(&self) -> StreamStatus {
        let inner = self.inner.lock();
        match &inner.terminal {
            Some(Ok(())) => StreamStatus::Completed,
            Some(Err(err)) => StreamStatus::Failed(err.clone()),
            None => StreamStatus::Receiving {
                next_seq: inner.next_seq,
                received: inner.received,
                total_length: inner.total_length,
            },
        }
    }
}

fn validate(
    inner: &StreamInner,
    seq: u64,
    bytes: Option<Bytes>,
    error: Option<String>,
    max_chunk_bytes: usize,
) -> Result<Bytes, StreamError> {
    if let Some(message) = error {
        return Err(StreamError::Client(message));
    }
    let chunk = match bytes {
        Some(chunk) if !chunk.is_empty() => chunk,
        _ => return Err(StreamError::EmptyChunk),
    };
    if chunk.len() > max_chunk_bytes {
        return Err(StreamError::ChunkTooLarge {
            len: chunk.len(),
            max: max_chunk_bytes,
        });
    }
    let received = inner.received + chunk.len() as u64;
    if received > inner.total_length {
        return Err(StreamError::DeclaredLengthExceeded {
            received,
            declared: inner.total_length,
        });
    }
    if seq != inner.next_seq {
        return Err(StreamError::OutOfSequence {
            expected: inner.next_seq,
            got: seq,
        });
    }
    Ok(chunk)
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<u64, Arc<StreamShared>>,
    closed: bool,
}

/// Per-circuit set of inbound chunk streams.
pub struct ChunkedStreamReassembler {
    table: Arc<Mutex<StreamTable>>,
    next_stream_id: AtomicU64,
    options: StreamOptions,
    faults: FaultReporter,
}

impl ChunkedStreamReassembler {
    pub fn new(options: StreamOptions, faults: FaultReporter) -> Self {
        Self {
            table: Arc::new(Mutex::new(StreamTable::default())),
            next_stream_id: AtomicU64::new(1),
            options,
            faults,
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Opens a stream with the configured chunk timeout.
    pub fn open(&self, total_length: u64) -> Result<(u64, ChunkStreamReader), CircuitError> {
        self.create(total_length, self.options.chunk_timeout)
    }

    /// Registers a stream expecting `total_length` bytes and starts its
    /// inactivity timer. Must be called from within a tokio runtime.
    ///
    /// Declared lengths above `max_stream_bytes` are refused before any
    /// state is created.
    pub fn create(
        &self,
        total_length: u64,
        chunk_timeout: Duration,
    ) -> Result<(u64, ChunkStreamReader), CircuitError> {
        if total_length > self.options.max_stream_bytes {
            warn!(
                target = "circuit_host::stream",
                circuit = %self.faults.circuit(),
                total_length,
                max = self.options.max_stream_bytes,
                "refusing oversized chunk stream"
            );
            return Err(CircuitError::StreamTooLarge {
                declared: total_length,
                max: self.options.max_stream_bytes,
            });
        }
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (changed, changes) = watch::channel(0u64);
        let shared = Arc::new(StreamShared {
            id: stream_id,
            inner: Mutex::new(StreamInner {
                total_length,
                received: 0,
                next_seq: 0,
                deadline: Instant::now() + chunk_timeout,
                timeout: chunk_timeout,
                chunks: VecDeque::new(),
                terminal: (total_length == 0).then_some(Ok(())),
            }),
            changed,
        });

        {
            let mut table = self.table.lock();
            if table.closed {
                return Err(CircuitError::Disposed);
            }
            if total_length > 0 {
                table.streams.insert(stream_id, shared.clone());
            }
        }
        if total_length > 0 {
            spawn_inactivity_timer(
                shared.clone(),
                Arc::downgrade(&self.table),
                self.faults.clone(),
            );
        }

        debug!(
            target = "circuit_host::stream",
            circuit = %self.faults.circuit(),
            stream_id,
            total_length,
            timeout_ms = chunk_timeout.as_millis() as u64,
            "chunk stream opened"
        );
        Ok((stream_id, ChunkStreamReader { shared, changes }))
    }

    /// Feeds one chunk into a stream. Returns whether the chunk was accepted;
    /// unknown or finished streams return `false` without side effects.
    pub fn receive_chunk(
        &self,
        stream_id: u64,
        seq: u64,
        bytes: Option<Bytes>,
        error: Option<String>,
    ) -> bool {
        let Some(shared) = self.table.lock().streams.get(&stream_id).cloned() else {
            debug!(
                target = "circuit_host::stream",
                circuit = %self.faults.circuit(),
                stream_id,
                seq,
                "chunk for unknown stream"
            );
            return false;
        };

        match shared.accept(seq, bytes, error, self.options.max_chunk_bytes) {
            ChunkOutcome::Accepted => true,
            ChunkOutcome::Completed => {
                self.table.lock().streams.remove(&stream_id);
                debug!(
                    target = "circuit_host::stream",
                    circuit = %self.faults.circuit(),
                    stream_id,
                    "chunk stream completed"
                );
                true
            }
            ChunkOutcome::Failed(err) => {
                self.table.lock().streams.remove(&stream_id);
                STREAM_FAILURES.with_label_values(&[err.reason()]).inc();
                warn!(
                    target = "circuit_host::stream",
                    circuit = %self.faults.circuit(),
                    stream_id,
                    seq,
                    error = %err,
                    "chunk stream failed"
                );
                false
            }
            ChunkOutcome::Rejected => false,
        }
    }

    /// Status of a stream that is still receiving. Finished streams are
    /// forgotten and report `None`.
    pub fn status(&self, stream_id: u64) -> Option<StreamStatus> {
        let shared = self.table.lock().streams.get(&stream_id).cloned()?;
        Some(shared.status())
    }

    pub fn open_streams(&self) -> usize {
        self.table.lock().streams.len()
    }

    /// Fails every open stream and refuses new ones.
    pub fn fail_all(&self, error: StreamError) -> usize {
        let drained: Vec<Arc<StreamShared>> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.streams.drain().map(|(_, shared)| shared).collect()
        };
        drained
            .into_iter()
            .filter(|shared| shared.fail(error.clone()))
            .count()
    }
}

fn spawn_inactivity_timer(
    shared: Arc<StreamShared>,
    table: Weak<Mutex<StreamTable>>,
    faults: FaultReporter,
) {
    let mut changes = shared.changed.subscribe();
    tokio::spawn(async move {
        loop {
            let deadline = {
                let inner = shared.inner.lock();
                if inner.terminal.is_some() {
                    return;
                }
                inner.deadline
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }

            let expired = {
                let inner = shared.inner.lock();
                inner.terminal.is_none() && Instant::now() >= inner.deadline
            };
            if !expired || !shared.fail(StreamError::TimedOut) {
                continue;
            }

            if let Some(table) = table.upgrade() {
                table.lock().streams.remove(&shared.id);
            }
            STREAM_FAILURES
                .with_label_values(&[StreamError::TimedOut.reason()])
                .inc();
            warn!(
                target = "circuit_host::stream",
                circuit = %faults.circuit(),
                stream_id = shared.id,
                "chunk stream timed out"
            );
            faults.report(CircuitError::Stream {
                stream_id: shared.id,
                source: StreamError::TimedOut,
            });
            return;
        }
    });
}

/// Consumer side of one chunk stream.
///
/// Clones share the stream: chunks go to whichever clone reads them first,
/// while completion and failure are observed by all of them.
#[derive(Clone)]
pub struct ChunkStreamReader {
    shared: Arc<StreamShared>,
    changes: watch::Receiver<u64>,
}

impl ChunkStreamReader {
    pub fn stream_id(&self) -> u64 {
        self.shared.id
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }

    /// Next chunk in order, `None` once the stream completed and drained.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, StreamError>> {
        loop {
            self.changes.borrow_and_update();
            {
                let mut inner = self.shared.inner.lock();
                if let Some(Err(err)) = &inner.terminal {
                    return Some(Err(err.clone()));
                }
                if let Some(chunk) = inner.chunks.pop_front() {
                    return Some(Ok(chunk));
                }
                if inner.terminal.is_some() {
                    return None;
                }
            }
            if self.changes.changed().await.is_err() {
                return Some(Err(StreamError::Disposed));
            }
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, StreamError> {
        let total_length = self.shared.inner.lock().total_length;
        // The buffer grows with what actually arrives.
        let capacity = total_length.min(DEFAULT_MAX_CHUNK_BYTES as u64) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        while let Some(chunk) = self.next_chunk().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Waits for the stream to finish without consuming any data.
    pub async fn outcome(&mut self) -> Result<(), StreamError> {
        loop {
            self.changes.borrow_and_update();
            if let Some(result) = self.shared.inner.lock().terminal.clone() {
                return result;
            }
            if self.changes.changed().await.is_err() {
                return Err(StreamError::Disposed);
            }
        }
    }
}
