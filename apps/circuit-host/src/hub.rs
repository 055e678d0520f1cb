//! Entry point the transport layer talks to.
//!
//! The hub maps connections onto circuits, drives the registry on connect and
//! disconnect, and drains the fault channel: every fault reaches the unhandled
//! fault callback, and fatal ones also notify the peer and tear the circuit
//! down.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit::{Circuit, CircuitHandler, CircuitId, CircuitIdFactory};
use crate::config::CircuitOptions;
use crate::delivery::AckOutcome;
use crate::error::CircuitError;
use crate::fault::{ChannelFaultSink, CircuitFault, FaultSink};
use crate::persistence::{InMemoryPausedCircuitStore, PausedCircuitStore, PersistedCircuitState};
use crate::registry::{CircuitRegistry, EvictionObserver, TransitionInterceptor};
use crate::stream::ChunkStreamReader;
use crate::transport::{ChannelHandle, ConnectionToken};

pub const GENERIC_FAULT_MESSAGE: &str = "There was an unhandled exception on the current circuit, so this circuit will be terminated. For more details turn on detailed exceptions by setting 'CIRCUIT_DETAILED_ERRORS'.";

pub type UnhandledFaultCallback = Arc<dyn Fn(&CircuitFault) + Send + Sync>;

pub struct CircuitHubBuilder {
    options: CircuitOptions,
    handlers: Vec<Arc<dyn CircuitHandler>>,
    paused: Option<Arc<dyn PausedCircuitStore>>,
    on_fault: Option<UnhandledFaultCallback>,
    interceptor: Option<Arc<dyn TransitionInterceptor>>,
    observer: Option<Arc<dyn EvictionObserver>>,
}

impl CircuitHubBuilder {
    pub fn handler(mut self, handler: Arc<dyn CircuitHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn paused_store(mut self, store: Arc<dyn PausedCircuitStore>) -> Self {
        self.paused = Some(store);
        self
    }

    pub fn on_unhandled_fault(mut self, callback: UnhandledFaultCallback) -> Self {
        self.on_fault = Some(callback);
        self
    }

    pub fn registry_instrumentation(
        mut self,
        interceptor: Arc<dyn TransitionInterceptor>,
        observer: Arc<dyn EvictionObserver>,
    ) -> Self {
        self.interceptor = Some(interceptor);
        self.observer = Some(observer);
        self
    }

    /// Builds the hub and spawns its fault drain on the current runtime.
    pub fn build(self) -> CircuitHub {
        let registry = match (self.interceptor, self.observer) {
            (Some(interceptor), Some(observer)) => CircuitRegistry::with_instrumentation(
                self.options.registry_options(),
                interceptor,
                observer,
            ),
            _ => CircuitRegistry::new(self.options.registry_options()),
        };
        let paused: Arc<dyn PausedCircuitStore> = match self.paused {
            Some(store) => store,
            None => Arc::new(InMemoryPausedCircuitStore::new(
                self.options.paused_store_options(),
            )),
        };
        let (sink, faults) = ChannelFaultSink::channel();

        let inner = Arc::new(HubInner {
            ids: self.options.id_factory(),
            options: self.options,
            registry,
            paused,
            handlers: Arc::from(self.handlers),
            connections: DashMap::new(),
            sink,
            on_fault: self.on_fault,
        });
        let drain = spawn_fault_drain(Arc::downgrade(&inner), faults);
        CircuitHub {
            inner,
            drain: Arc::new(drain),
        }
    }
}

#[derive(Clone)]
pub struct CircuitHub {
    inner: Arc<HubInner>,
    drain: Arc<JoinHandle<()>>,
}

struct HubInner {
    options: CircuitOptions,
    ids: CircuitIdFactory,
    registry: CircuitRegistry,
    paused: Arc<dyn PausedCircuitStore>,
    handlers: Arc<[Arc<dyn CircuitHandler>]>,
    connections: DashMap<ConnectionToken, Arc<Circuit>>,
    sink: Arc<ChannelFaultSink>,
    on_fault: Option<UnhandledFaultCallback>,
}

impl CircuitHub {
    pub fn builder(options: CircuitOptions) -> CircuitHubBuilder {
        CircuitHubBuilder {
            options,
            handlers: Vec::new(),
            paused: None,
            on_fault: None,
            interceptor: None,
            observer: None,
        }
    }

    pub fn registry(&self) -> &CircuitRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &CircuitOptions {
        &self.inner.options
    }

    pub fn circuit_for(&self, connection: ConnectionToken) -> Option<Arc<Circuit>> {
        self.inner
            .connections
            .get(&connection)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Creates a circuit bound to `channel` and runs its opening hooks.
    pub async fn start_circuit(&self, channel: ChannelHandle) -> Result<Arc<Circuit>, CircuitError> {
        let circuit = self.inner.new_circuit(self.inner.ids.create());
        self.inner.adopt(circuit, channel).await
    }

    /// Reattaches a peer to its circuit. Tokens that fail validation are
    /// indistinguishable from unknown circuits.
    pub async fn connect_circuit(&self, token: &str, channel: ChannelHandle) -> Option<Arc<Circuit>> {
        let id = match self.inner.ids.parse(token) {
            Ok(id) => id,
            Err(err) => {
                debug!(
                    target = "circuit_host::hub",
                    error = %err,
                    "rejecting circuit token"
                );
                return None;
            }
        };
        let connection = channel.connection();
        let previous = self
            .inner
            .registry
            .find(&id)
            .and_then(|circuit| circuit.connection());
        let circuit = self.inner.registry.connect(&id, channel).await?;
        // A live swap leaves the replaced connection mapped to this circuit.
        if let Some(previous) = previous.filter(|previous| *previous != connection) {
            self.inner
                .connections
                .remove_if(&previous, |_, bound| Arc::ptr_eq(bound, &circuit));
        }
        self.inner
            .connections
            .insert(connection, Arc::clone(&circuit));
        Some(circuit)
    }

    pub async fn connection_closed(&self, connection: ConnectionToken) -> bool {
        let Some((_, circuit)) = self.inner.connections.remove(&connection) else {
            return false;
        };
        self.inner.registry.disconnect(&circuit, connection).await
    }

    pub async fn render(&self, circuit: &Circuit, payload: Bytes) -> Result<u64, CircuitError> {
        circuit.render(payload).await
    }

    /// Renders `payload` into every connected circuit. Returns how many
    /// circuits accepted it.
    pub async fn render_all(&self, payload: Bytes) -> usize {
        let mut rendered = 0;
        for circuit in self.inner.registry.connected_circuits() {
            match circuit.render(payload.clone()).await {
                Ok(_) => rendered += 1,
                Err(err) => debug!(
                    target = "circuit_host::hub",
                    circuit = %circuit.id(),
                    error = %err,
                    "skipping circuit during render"
                ),
            }
        }
        rendered
    }

    pub fn on_render_completed(
        &self,
        connection: ConnectionToken,
        batch_id: u64,
        error: Option<String>,
    ) -> Result<AckOutcome, CircuitError> {
        let circuit = self.circuit_for(connection).ok_or(CircuitError::Disposed)?;
        circuit.on_render_completed(batch_id, error)
    }

    pub fn begin_upload(
        &self,
        connection: ConnectionToken,
        total_length: u64,
    ) -> Result<(u64, ChunkStreamReader), CircuitError> {
        let circuit = self.circuit_for(connection).ok_or(CircuitError::Disposed)?;
        circuit.begin_upload(total_length)
    }

    pub fn receive_chunk(
        &self,
        connection: ConnectionToken,
        stream_id: u64,
        seq: u64,
        bytes: Option<Bytes>,
        error: Option<String>,
    ) -> bool {
        match self.circuit_for(connection) {
            Some(circuit) => circuit.receive_chunk(stream_id, seq, bytes, error),
            None => false,
        }
    }

    /// Client-initiated teardown.
    pub async fn end_circuit(&self, connection: ConnectionToken) -> bool {
        let Some((_, circuit)) = self.inner.connections.remove(&connection) else {
            return false;
        };
        info!(
            target = "circuit_host::hub",
            circuit = %circuit.id(),
            "client ended circuit"
        );
        self.inner.registry.terminate(&circuit).await;
        true
    }

    /// Stores the circuit's application state and disposes the circuit. The
    /// peer keeps its token to resume later.
    pub async fn pause_circuit(&self, connection: ConnectionToken) -> Result<(), CircuitError> {
        let circuit = self.circuit_for(connection).ok_or(CircuitError::Disposed)?;
        let state = PersistedCircuitState {
            application_state: circuit.application_state().unwrap_or_default(),
        };
        if let Err(err) = self.inner.paused.persist(circuit.id(), state, None).await {
            warn!(
                target = "circuit_host::hub",
                circuit = %circuit.id(),
                error = %err,
                "failed to persist paused circuit"
            );
            return Err(CircuitError::Disposed);
        }
        self.inner.connections.remove(&connection);
        self.inner.registry.terminate(&circuit).await;
        info!(
            target = "circuit_host::hub",
            circuit = %circuit.id(),
            "circuit paused"
        );
        Ok(())
    }

    /// Starts a new circuit from state stored by `pause_circuit`. The resumed
    /// circuit has a new identity.
    pub async fn resume_circuit(&self, token: &str, channel: ChannelHandle) -> Option<Arc<Circuit>> {
        let paused_id = self.inner.ids.parse(token).ok()?;
        let state = match self.inner.paused.restore(&paused_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(
                    target = "circuit_host::hub",
                    circuit = %paused_id,
                    "no paused state to resume"
                );
                return None;
            }
            Err(err) => {
                warn!(
                    target = "circuit_host::hub",
                    circuit = %paused_id,
                    error = %err,
                    "failed to restore paused circuit"
                );
                return None;
            }
        };

        let circuit = self.inner.new_circuit(self.inner.ids.create());
        circuit.set_application_state(state.application_state);
        match self.inner.adopt(circuit, channel).await {
            Ok(circuit) => {
                info!(
                    target = "circuit_host::hub",
                    paused = %paused_id,
                    circuit = %circuit.id(),
                    "paused circuit resumed"
                );
                Some(circuit)
            }
            Err(_) => None,
        }
    }

    /// Stops the fault drain. Circuits are left as they are.
    pub fn shutdown(&self) {
        self.drain.abort();
    }
}

impl HubInner {
    fn new_circuit(&self, id: CircuitId) -> Arc<Circuit> {
        let sink: Arc<dyn FaultSink> = self.sink.clone();
        Circuit::new(
            id,
            Arc::clone(&self.handlers),
            self.options.delivery_options(),
            self.options.stream_options(),
            sink,
        )
    }

    async fn adopt(
        &self,
        circuit: Arc<Circuit>,
        channel: ChannelHandle,
    ) -> Result<Arc<Circuit>, CircuitError> {
        let connection = channel.connection();
        circuit.delivery().swap_channel(channel);
        self.registry.register(Arc::clone(&circuit))?;
        self.connections.insert(connection, Arc::clone(&circuit));

        if let Err(err) = circuit.initialize().await {
            self.connections.remove(&connection);
            circuit.report_fault(err.clone());
            self.registry.terminate(&circuit).await;
            return Err(err);
        }
        circuit.delivery().flush().await;
        info!(
            target = "circuit_host::hub",
            circuit = %circuit.id(),
            connection = %connection,
            "circuit started"
        );
        Ok(circuit)
    }

    fn client_message(&self, error: &CircuitError) -> String {
        if self.options.detailed_errors {
            error.to_string()
        } else {
            GENERIC_FAULT_MESSAGE.to_string()
        }
    }

    async fn handle_fault(&self, fault: CircuitFault) {
        if let Some(callback) = &self.on_fault {
            callback(&fault);
        }
        if !fault.is_fatal() {
            return;
        }
        let Some(circuit) = self.registry.find(&fault.circuit) else {
            debug!(
                target = "circuit_host::hub",
                circuit = %fault.circuit,
                "fault for a circuit that is already gone"
            );
            return;
        };
        if let Some(channel) = circuit.channel() {
            if let Err(err) = channel.send_error(&self.client_message(&fault.error)).await {
                debug!(
                    target = "circuit_host::hub",
                    circuit = %fault.circuit,
                    error = %err,
                    "could not notify peer of fault"
                );
            }
        }
        self.connections
            .retain(|_, bound| !Arc::ptr_eq(bound, &circuit));
        self.registry.terminate(&circuit).await;
    }
}

fn spawn_fault_drain(
    hub: Weak<HubInner>,
    mut faults: mpsc::UnboundedReceiver<CircuitFault>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fault) = faults.recv().await {
            let Some(hub) = hub.upgrade() else {
                break;
            };
            hub.handle_fault(fault).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingChannel;
    use crate::transport::ClientChannel;
    use parking_lot::Mutex;

    fn hub_with_faults(options: CircuitOptions) -> (CircuitHub, Arc<Mutex<Vec<CircuitFault>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hub = CircuitHub::builder(options)
            .on_unhandled_fault(Arc::new(move |fault: &CircuitFault| {
                sink.lock().push(fault.clone())
            }))
            .build();
        (hub, seen)
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn tampered_token_is_treated_as_unknown() {
        let (hub, _) = hub_with_faults(CircuitOptions::default());
        let circuit = hub.start_circuit(RecordingChannel::new()).await.unwrap();
        let token = circuit.id().token();
        let first = if token.starts_with('A') { 'B' } else { 'A' };
        let forged = format!("{first}{}", &token[1..]);

        assert!(hub.connect_circuit(&forged, RecordingChannel::new()).await.is_none());
        assert!(hub.connect_circuit("garbage", RecordingChannel::new()).await.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn fatal_ack_sends_generic_error_and_terminates() {
        let (hub, seen) = hub_with_faults(CircuitOptions::default());
        let channel = RecordingChannel::new();
        let circuit = hub.start_circuit(channel.clone()).await.unwrap();
        hub.render(&circuit, Bytes::from_static(b"one")).await.unwrap();

        assert!(hub.on_render_completed(channel.connection(), 9, None).is_err());
        channel.wait_for_errors(1).await;
        assert_eq!(channel.errors(), vec![GENERIC_FAULT_MESSAGE.to_string()]);

        while !circuit.is_disposed() {
            tokio::task::yield_now().await;
        }
        assert!(hub.circuit_for(channel.connection()).is_none());
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].is_fatal());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn detailed_errors_expose_the_message() {
        let (hub, _) = hub_with_faults(CircuitOptions {
            detailed_errors: true,
            ..CircuitOptions::default()
        });
        let channel = RecordingChannel::new();
        let circuit = hub.start_circuit(channel.clone()).await.unwrap();
        hub.render(&circuit, Bytes::from_static(b"one")).await.unwrap();
        hub.on_render_completed(channel.connection(), 1, Some("bad patch".into()))
            .unwrap();

        channel.wait_for_errors(1).await;
        assert!(channel.errors()[0].contains("bad patch"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn pause_then_resume_restores_state_under_a_new_id() {
        let (hub, _) = hub_with_faults(CircuitOptions::default());
        let first = RecordingChannel::new();
        let circuit = hub.start_circuit(first.clone()).await.unwrap();
        circuit.set_application_state(Bytes::from_static(b"counter=4"));
        let token = circuit.id().token().to_string();

        hub.pause_circuit(first.connection()).await.unwrap();
        assert!(circuit.is_disposed());
        assert!(hub.connect_circuit(&token, RecordingChannel::new()).await.is_none());

        let resumed = hub.resume_circuit(&token, RecordingChannel::new()).await.unwrap();
        assert_ne!(resumed.id(), circuit.id());
        assert_eq!(
            resumed.application_state(),
            Some(Bytes::from_static(b"counter=4"))
        );
        assert!(hub.resume_circuit(&token, RecordingChannel::new()).await.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn end_circuit_tears_down() {
        let (hub, _) = hub_with_faults(CircuitOptions::default());
        let channel = RecordingChannel::new();
        let circuit = hub.start_circuit(channel.clone()).await.unwrap();
        assert!(hub.end_circuit(channel.connection()).await);
        assert!(circuit.is_disposed());
        assert!(!hub.end_circuit(channel.connection()).await);
        assert!(hub
            .connect_circuit(circuit.id().token(), RecordingChannel::new())
            .await
            .is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn live_swap_unbinds_the_replaced_connection() {
        let (hub, _) = hub_with_faults(CircuitOptions::default());
        let first = RecordingChannel::new();
        let circuit = hub.start_circuit(first.clone()).await.unwrap();
        hub.render(&circuit, Bytes::from_static(b"one")).await.unwrap();

        let second = RecordingChannel::new();
        hub.connect_circuit(circuit.id().token(), second.clone())
            .await
            .unwrap();

        assert!(hub.circuit_for(first.connection()).is_none());
        assert!(Arc::ptr_eq(
            &hub.circuit_for(second.connection()).unwrap(),
            &circuit
        ));
        assert_eq!(
            hub.on_render_completed(first.connection(), 1, None),
            Err(CircuitError::Disposed)
        );
        assert!(!hub.end_circuit(first.connection()).await);
        assert!(!hub.connection_closed(first.connection()).await);
        assert!(!circuit.is_disposed());
        assert_eq!(circuit.connection(), Some(second.connection()));
    }
}
