use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{error, warn};

use crate::circuit::CircuitId;
use crate::error::CircuitError;
use crate::metrics::CIRCUIT_FAULTS;

#[derive(Debug, Clone)]
pub struct CircuitFault {
    pub circuit: CircuitId,
    pub error: CircuitError,
}

impl CircuitFault {
    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

/// Escalation path for anything a circuit cannot resolve locally.
pub trait FaultSink: Send + Sync {
    fn report(&self, fault: CircuitFault);
}

/// Per-circuit handle onto a shared sink.
#[derive(Clone)]
pub struct FaultReporter {
    circuit: CircuitId,
    sink: Arc<dyn FaultSink>,
}

impl FaultReporter {
    pub fn new(circuit: CircuitId, sink: Arc<dyn FaultSink>) -> Self {
        Self { circuit, sink }
    }

    pub fn circuit(&self) -> &CircuitId {
        &self.circuit
    }

    pub fn report(&self, error: CircuitError) {
        let fatal = error.is_fatal();
        CIRCUIT_FAULTS
            .with_label_values(&[error.kind(), if fatal { "true" } else { "false" }])
            .inc();
        if fatal {
            error!(
                target = "circuit_host::fault",
                circuit = %self.circuit,
                kind = error.kind(),
                error = %error,
                "fatal circuit fault"
            );
        } else {
            warn!(
                target = "circuit_host::fault",
                circuit = %self.circuit,
                kind = error.kind(),
                error = %error,
                "circuit fault"
            );
        }
        self.sink.report(CircuitFault {
            circuit: self.circuit.clone(),
            error,
        });
    }
}

/// Forwards faults onto an unbounded channel drained by the hub.
pub struct ChannelFaultSink {
    tx: mpsc::UnboundedSender<CircuitFault>,
}

impl ChannelFaultSink {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<CircuitFault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl FaultSink for ChannelFaultSink {
    fn report(&self, fault: CircuitFault) {
        if self.tx.send(fault).is_err() {
            warn!(
                target = "circuit_host::fault",
                "fault receiver dropped; discarding fault"
            );
        }
    }
}

/// Keeps every reported fault in memory.
#[derive(Default)]
pub struct RecordingFaultSink {
    faults: Mutex<Vec<CircuitFault>>,
    reported: Notify,
}

impl RecordingFaultSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn faults(&self) -> Vec<CircuitFault> {
        self.faults.lock().clone()
    }

    pub fn errors(&self) -> Vec<CircuitError> {
        self.faults.lock().iter().map(|f| f.error.clone()).collect()
    }

    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.reported.notified();
            if self.faults.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl FaultSink for RecordingFaultSink {
    fn report(&self, fault: CircuitFault) {
        self.faults.lock().push(fault);
        self.reported.notify_waiters();
    }
}
