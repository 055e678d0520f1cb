pub mod handler;
pub mod id;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub use handler::{CircuitHandler, HandlerHook};
pub use id::{CircuitId, CircuitIdFactory, TokenError};

use crate::delivery::{AckOutcome, AckedDeliveryQueue, DeliveryOptions};
use crate::error::CircuitError;
use crate::fault::{FaultReporter, FaultSink};
use crate::stream::{ChunkStreamReader, ChunkedStreamReassembler, StreamError, StreamOptions};
use crate::transport::{ChannelHandle, ConnectionToken};

/// A server-held session that outlives individual connections.
///
/// The circuit owns its outbound batch queue and its inbound chunk streams.
/// Registry transitions serialize on `transition`; handler hooks serialize on
/// `dispatcher` so they observe transitions in the order they were committed
/// even though they run after the transition lock is released.
pub struct Circuit {
    id: CircuitId,
    handlers: Arc<[Arc<dyn CircuitHandler>]>,
    delivery: AckedDeliveryQueue,
    streams: ChunkedStreamReassembler,
    faults: FaultReporter,
    transition: tokio::sync::Mutex<()>,
    dispatcher: Arc<tokio::sync::Mutex<()>>,
    application_state: Mutex<Option<Bytes>>,
    closing: AtomicBool,
    disposed: AtomicBool,
}

impl Circuit {
    pub fn new(
        id: CircuitId,
        handlers: Arc<[Arc<dyn CircuitHandler>]>,
        delivery: DeliveryOptions,
        streams: StreamOptions,
        sink: Arc<dyn FaultSink>,
    ) -> Arc<Self> {
        let faults = FaultReporter::new(id.clone(), sink);
        Arc::new(Self {
            delivery: AckedDeliveryQueue::new(delivery, faults.clone()),
            streams: ChunkedStreamReassembler::new(streams, faults.clone()),
            id,
            handlers,
            faults,
            transition: tokio::sync::Mutex::new(()),
            dispatcher: Arc::new(tokio::sync::Mutex::new(())),
            application_state: Mutex::new(None),
            closing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    pub fn delivery(&self) -> &AckedDeliveryQueue {
        &self.delivery
    }

    pub fn streams(&self) -> &ChunkedStreamReassembler {
        &self.streams
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        self.delivery.channel()
    }

    pub fn connection(&self) -> Option<ConnectionToken> {
        self.delivery.connection()
    }

    /// Queues a render batch for the peer.
    pub async fn render(&self, payload: Bytes) -> Result<u64, CircuitError> {
        if self.is_closing() {
            return Err(CircuitError::Disposed);
        }
        self.delivery.enqueue(payload).await
    }

    /// Applies the peer's acknowledgement. Protocol violations are reported as
    /// faults before being returned.
    pub fn on_render_completed(
        &self,
        batch_id: u64,
        error: Option<String>,
    ) -> Result<AckOutcome, CircuitError> {
        self.delivery
            .acknowledge(batch_id, error)
            .inspect_err(|err| self.faults.report(err.clone()))
    }

    pub fn begin_upload(&self, total_length: u64) -> Result<(u64, ChunkStreamReader), CircuitError> {
        self.streams.open(total_length)
    }

    pub fn receive_chunk(
        &self,
        stream_id: u64,
        seq: u64,
        bytes: Option<Bytes>,
        error: Option<String>,
    ) -> bool {
        self.streams.receive_chunk(stream_id, seq, bytes, error)
    }

    pub fn set_application_state(&self, state: Bytes) {
        *self.application_state.lock() = Some(state);
    }

    pub fn application_state(&self) -> Option<Bytes> {
        self.application_state.lock().clone()
    }

    pub fn report_fault(&self, error: CircuitError) {
        self.faults.report(error);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn transition_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.transition
    }

    pub(crate) async fn dispatch_guard(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.dispatcher).lock_owned().await
    }

    /// Runs handler hooks. Callers hold the dispatch guard.
    pub(crate) async fn run_hooks(&self, hooks: &[HandlerHook]) -> Result<(), CircuitError> {
        handler::invoke_handlers(&self.handlers, &self.id, hooks).await
    }

    /// Runs the opening hooks for a brand new circuit.
    pub(crate) async fn initialize(&self) -> Result<(), CircuitError> {
        let _dispatch = self.dispatch_guard().await;
        self.run_hooks(&[HandlerHook::CircuitOpened, HandlerHook::ConnectionUp])
            .await?;
        info!(
            target = "circuit_host::circuit",
            circuit = %self.id,
            "circuit initialized"
        );
        Ok(())
    }

    /// Tears the circuit down. Safe to call more than once; only the first
    /// call does anything. Handler failures are logged and swallowed.
    pub async fn dispose(&self) {
        self.mark_closing();
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _dispatch = self.dispatch_guard().await;

        let was_connected = self.delivery.detach_channel().is_some();
        let hooks: &[HandlerHook] = if was_connected {
            &[HandlerHook::ConnectionDown, HandlerHook::CircuitClosed]
        } else {
            &[HandlerHook::CircuitClosed]
        };
        if let Err(err) = self.run_hooks(hooks).await {
            warn!(
                target = "circuit_host::circuit",
                circuit = %self.id,
                error = %err,
                "handlers failed during disposal"
            );
        }

        let released = self.delivery.close();
        let failed_streams = self.streams.fail_all(StreamError::Disposed);
        debug!(
            target = "circuit_host::circuit",
            circuit = %self.id,
            released,
            failed_streams,
            "circuit resources released"
        );
        info!(
            target = "circuit_host::circuit",
            circuit = %self.id,
            "circuit disposed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::RecordingFaultSink;
    use crate::transport::mock::RecordingChannel;
    use async_trait::async_trait;

    #[derive(Default)]
    struct HookLog {
        hooks: Mutex<Vec<HandlerHook>>,
        fail_closed: bool,
    }

    #[async_trait]
    impl CircuitHandler for HookLog {
        async fn on_circuit_opened(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
            self.hooks.lock().push(HandlerHook::CircuitOpened);
            Ok(())
        }

        async fn on_connection_up(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
            self.hooks.lock().push(HandlerHook::ConnectionUp);
            Ok(())
        }

        async fn on_connection_down(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
            self.hooks.lock().push(HandlerHook::ConnectionDown);
            Ok(())
        }

        async fn on_circuit_closed(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
            self.hooks.lock().push(HandlerHook::CircuitClosed);
            if self.fail_closed {
                anyhow::bail!("close failed");
            }
            Ok(())
        }
    }

    fn circuit_with(handler: Arc<HookLog>) -> (Arc<Circuit>, Arc<RecordingFaultSink>) {
        let sink = RecordingFaultSink::new();
        let handlers: Arc<[Arc<dyn CircuitHandler>]> = Arc::from(vec![handler as Arc<dyn CircuitHandler>]);
        let circuit = Circuit::new(
            CircuitIdFactory::random().create(),
            handlers,
            DeliveryOptions::default(),
            StreamOptions::default(),
            sink.clone(),
        );
        (circuit, sink)
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn initialize_runs_opened_then_connection_up() {
        let log = Arc::new(HookLog::default());
        let (circuit, _) = circuit_with(log.clone());
        circuit.initialize().await.unwrap();
        assert_eq!(
            *log.hooks.lock(),
            vec![HandlerHook::CircuitOpened, HandlerHook::ConnectionUp]
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn dispose_releases_everything_once() {
        let log = Arc::new(HookLog::default());
        let (circuit, _) = circuit_with(log.clone());
        let channel = RecordingChannel::new();
        circuit.delivery().rebind_channel(channel.clone()).await;
        circuit.render(Bytes::from_static(b"one")).await.unwrap();
        let (_, mut upload) = circuit.begin_upload(10).unwrap();

        circuit.dispose().await;
        circuit.dispose().await;

        assert_eq!(
            *log.hooks.lock(),
            vec![HandlerHook::ConnectionDown, HandlerHook::CircuitClosed]
        );
        assert!(circuit.is_disposed());
        assert!(circuit.delivery().pending_batch_ids().is_empty());
        assert_eq!(upload.outcome().await, Err(StreamError::Disposed));
        assert_eq!(
            circuit.render(Bytes::from_static(b"late")).await,
            Err(CircuitError::Disposed)
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn dispose_of_disconnected_circuit_skips_connection_down() {
        let log = Arc::new(HookLog {
            fail_closed: true,
            ..Default::default()
        });
        let (circuit, sink) = circuit_with(log.clone());
        circuit.dispose().await;
        assert_eq!(*log.hooks.lock(), vec![HandlerHook::CircuitClosed]);
        assert!(sink.faults().is_empty(), "disposal never escalates");
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn bad_ack_is_reported_as_fault() {
        let (circuit, sink) = circuit_with(Arc::new(HookLog::default()));
        circuit.render(Bytes::from_static(b"one")).await.unwrap();
        let err = circuit.on_render_completed(5, None).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sink.errors(), vec![err]);
    }
}
