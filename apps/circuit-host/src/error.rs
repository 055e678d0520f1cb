use std::fmt;

use thiserror::Error;

use crate::circuit::HandlerHook;
use crate::stream::StreamError;

/// Session-level error taxonomy.
///
/// Fatal variants always end in full circuit teardown; the rest are reported
/// for observability only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("circuit {0} is already registered")]
    DuplicateCircuit(String),
    #[error(
        "received an acknowledgement for batch {batch_id} but the last produced batch is {last_produced}"
    )]
    AckBeyondRange { batch_id: u64, last_produced: u64 },
    #[error("client failed to apply batch {batch_id}: {message}")]
    ClientBatchError { batch_id: u64, message: String },
    #[error("stream {stream_id} failed: {source}")]
    Stream {
        stream_id: u64,
        #[source]
        source: StreamError,
    },
    #[error("declared stream length {declared} exceeds the permitted {max} bytes")]
    StreamTooLarge { declared: u64, max: u64 },
    #[error("circuit handlers failed: {}", join_failures(.failures))]
    HandlerFailed { failures: Vec<HandlerFailure> },
    #[error("transport unusable: {0}")]
    TransportUnusable(String),
    #[error("circuit has been disposed")]
    Disposed,
}

impl CircuitError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CircuitError::AckBeyondRange { .. }
                | CircuitError::ClientBatchError { .. }
                | CircuitError::Stream { .. }
                | CircuitError::HandlerFailed { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CircuitError::DuplicateCircuit(_) => "duplicate_circuit",
            CircuitError::AckBeyondRange { .. } => "ack_beyond_range",
            CircuitError::ClientBatchError { .. } => "client_batch_error",
            CircuitError::Stream { .. } => "stream",
            CircuitError::StreamTooLarge { .. } => "stream_too_large",
            CircuitError::HandlerFailed { .. } => "handler_failed",
            CircuitError::TransportUnusable(_) => "transport_unusable",
            CircuitError::Disposed => "disposed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub hook: HandlerHook,
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} ({})", self.handler, self.hook, self.message)
    }
}

fn join_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
