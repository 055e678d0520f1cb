//! Live and retained circuits.
//!
//! A circuit is either connected (in the live map) or disconnected (in the
//! retention cache), never both and never neither while it exists. Moves
//! between the two always insert into the destination before removing from
//! the source, and happen under the circuit's transition lock, so a locked
//! observer never sees it in both places. Lookups go through a separate index
//! that only loses a circuit on teardown or eviction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cache::{CacheOptions, EvictionCache, EvictionCallback, EvictionReason};
use crate::circuit::{Circuit, CircuitId, HandlerHook};
use crate::error::CircuitError;
use crate::metrics::{CIRCUITS_CONNECTED, CIRCUITS_DISCONNECTED, CIRCUIT_EVICTIONS};
use crate::transport::{ChannelHandle, ConnectionToken};

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_retained: usize,
    pub retention: Duration,
    pub scan_interval: Duration,
    /// Cost charged against `max_retained` for each disconnected circuit.
    pub entry_cost: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_retained: 100,
            retention: Duration::from_secs(180),
            scan_interval: Duration::from_secs(1),
            entry_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPresence {
    Connected,
    Disconnected,
    Absent,
}

/// Called while a transition holds the circuit's lock.
#[async_trait]
pub trait TransitionInterceptor: Send + Sync {
    async fn connect_locked(&self, _circuit: &CircuitId) {}

    async fn disconnect_locked(&self, _circuit: &CircuitId) {}
}

/// Told about every circuit dropped from retention by expiry or capacity.
pub trait EvictionObserver: Send + Sync {
    fn circuit_evicted(&self, _circuit: &CircuitId, _reason: EvictionReason) {}
}

struct NoopInterceptor;

impl TransitionInterceptor for NoopInterceptor {}

struct NoopObserver;

impl EvictionObserver for NoopObserver {}

#[derive(Clone)]
pub struct CircuitRegistry {
    inner: Arc<RegistryInner>,
}

type CircuitIndex = Arc<DashMap<String, Arc<Circuit>>>;

struct RegistryInner {
    circuits: CircuitIndex,
    connected: DashMap<String, Arc<Circuit>>,
    disconnected: EvictionCache<String, Arc<Circuit>>,
    options: RegistryOptions,
    interceptor: Arc<dyn TransitionInterceptor>,
}

impl CircuitRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self::with_instrumentation(options, Arc::new(NoopInterceptor), Arc::new(NoopObserver))
    }

    pub fn with_instrumentation(
        options: RegistryOptions,
        interceptor: Arc<dyn TransitionInterceptor>,
        observer: Arc<dyn EvictionObserver>,
    ) -> Self {
        let circuits: CircuitIndex = Arc::new(DashMap::new());
        let index = Arc::clone(&circuits);
        let on_evict: EvictionCallback<String, Arc<Circuit>> =
            Arc::new(move |_key: String, circuit: Arc<Circuit>, reason: EvictionReason| {
                retention_ended(&index, &*observer, circuit, reason)
            });
        let disconnected = EvictionCache::new(
            "disconnected_circuits",
            CacheOptions {
                capacity: options.max_retained,
                ttl: options.retention,
                scan_interval: options.scan_interval,
            },
            on_evict,
        );
        Self {
            inner: Arc::new(RegistryInner {
                circuits,
                connected: DashMap::new(),
                disconnected,
                options,
                interceptor,
            }),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Adds a freshly created circuit to the live set.
    pub fn register(&self, circuit: Arc<Circuit>) -> Result<(), CircuitError> {
        let key = self.index(&circuit)?;
        self.inner.connected.insert(key, circuit);
        CIRCUITS_CONNECTED.inc();
        Ok(())
    }

    /// Seeds a circuit straight into retention, as if it had just lost its
    /// connection.
    pub fn register_disconnected(&self, circuit: Arc<Circuit>) -> Result<(), CircuitError> {
        let key = self.index(&circuit)?;
        circuit.delivery().detach_channel();
        self.retain(key, circuit);
        Ok(())
    }

    /// Binds `channel` to the circuit identified by `id`.
    ///
    /// A retained circuit is moved back to the live set and gets the resumed
    /// and connection-up hooks; a circuit that was already live only swaps its
    /// channel and gets connection-up. Pending batches are replayed onto the
    /// new channel. If a hook fails the circuit is torn down and `None` is
    /// returned, the same as for an unknown id.
    pub async fn connect(&self, id: &CircuitId, channel: ChannelHandle) -> Option<Arc<Circuit>> {
        let circuit = self.lookup(id)?;
        let key = id.key();

        let transition = circuit.transition_lock().lock().await;
        if circuit.is_closing() {
            debug!(
                target = "circuit_host::registry",
                circuit = %id,
                "connect raced with teardown"
            );
            return None;
        }
        self.inner.interceptor.connect_locked(id).await;

        let resumed = if self.is_live(&circuit) {
            false
        } else {
            self.inner
                .connected
                .insert(key.to_string(), Arc::clone(&circuit));
            if self.inner.disconnected.remove(key).is_none() {
                // evicted while we waited for the lock
                self.inner
                    .connected
                    .remove_if(key, |_, live| Arc::ptr_eq(live, &circuit));
                debug!(
                    target = "circuit_host::registry",
                    circuit = %id,
                    "circuit left retention before reconnect"
                );
                return None;
            }
            CIRCUITS_CONNECTED.inc();
            true
        };
        let connection = channel.connection();
        circuit.delivery().swap_channel(channel);

        let dispatch = circuit.dispatch_guard().await;
        drop(transition);

        circuit.delivery().flush().await;
        let hooks: &[HandlerHook] = if resumed {
            &[HandlerHook::CircuitResumed, HandlerHook::ConnectionUp]
        } else {
            &[HandlerHook::ConnectionUp]
        };
        if let Err(err) = circuit.run_hooks(hooks).await {
            circuit.mark_closing();
            drop(dispatch);
            circuit.report_fault(err);
            self.terminate(&circuit).await;
            return None;
        }
        drop(dispatch);

        info!(
            target = "circuit_host::registry",
            circuit = %id,
            connection = %connection,
            resumed,
            "circuit connected"
        );
        Some(circuit)
    }

    /// Moves the circuit into retention if `connection` is still the one it is
    /// bound to. Stale disconnects return `false` and change nothing.
    pub async fn disconnect(&self, circuit: &Arc<Circuit>, connection: ConnectionToken) -> bool {
        let id = circuit.id();
        let transition = circuit.transition_lock().lock().await;
        if circuit.is_closing() {
            return false;
        }
        self.inner.interceptor.disconnect_locked(id).await;

        if circuit.connection() != Some(connection) || !self.is_live(circuit) {
            debug!(
                target = "circuit_host::registry",
                circuit = %id,
                connection = %connection,
                "ignoring stale disconnect"
            );
            return false;
        }

        circuit.delivery().detach_channel();
        let key = id.key().to_string();
        self.retain(key.clone(), Arc::clone(circuit));
        if self
            .inner
            .connected
            .remove_if(&key, |_, live| Arc::ptr_eq(live, circuit))
            .is_some()
        {
            CIRCUITS_CONNECTED.dec();
        }

        let dispatch = circuit.dispatch_guard().await;
        drop(transition);

        info!(
            target = "circuit_host::registry",
            circuit = %id,
            connection = %connection,
            "circuit disconnected"
        );
        if let Err(err) = circuit.run_hooks(&[HandlerHook::ConnectionDown]).await {
            circuit.mark_closing();
            drop(dispatch);
            circuit.report_fault(err);
            self.terminate(circuit).await;
        }
        true
    }

    /// Removes the circuit from both sets and disposes it.
    pub async fn terminate(&self, circuit: &Arc<Circuit>) {
        {
            let _transition = circuit.transition_lock().lock().await;
            circuit.mark_closing();
            let key = circuit.id().key();
            if self
                .inner
                .connected
                .remove_if(key, |_, live| Arc::ptr_eq(live, circuit))
                .is_some()
            {
                CIRCUITS_CONNECTED.dec();
            }
            self.inner.disconnected.remove(key);
            self.inner
                .circuits
                .remove_if(key, |_, known| Arc::ptr_eq(known, circuit));
        }
        circuit.dispose().await;
    }

    /// Where the circuit is, as seen by an observer that waits out any
    /// in-flight transition.
    pub async fn presence(&self, id: &CircuitId) -> CircuitPresence {
        let Some(circuit) = self.lookup(id) else {
            return CircuitPresence::Absent;
        };
        let _transition = circuit.transition_lock().lock().await;
        let live = self.is_live(&circuit);
        let retained = self
            .inner
            .disconnected
            .try_get(id.key())
            .is_some_and(|held| Arc::ptr_eq(&held, &circuit));
        debug_assert!(!(live && retained), "circuit {id} is both live and retained");
        match (live, retained) {
            (true, _) => CircuitPresence::Connected,
            (false, true) => CircuitPresence::Disconnected,
            (false, false) => CircuitPresence::Absent,
        }
    }

    /// Finds a circuit whether it is connected or retained.
    pub fn find(&self, id: &CircuitId) -> Option<Arc<Circuit>> {
        self.lookup(id)
    }

    pub fn connected_circuits(&self) -> Vec<Arc<Circuit>> {
        self.inner
            .connected
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connected.len()
    }

    pub fn disconnected_count(&self) -> usize {
        self.inner.disconnected.len()
    }

    fn lookup(&self, id: &CircuitId) -> Option<Arc<Circuit>> {
        let circuit = self
            .inner
            .circuits
            .get(id.key())
            .map(|entry| Arc::clone(entry.value()))?;
        (circuit.id() == id).then_some(circuit)
    }

    fn index(&self, circuit: &Arc<Circuit>) -> Result<String, CircuitError> {
        match self.inner.circuits.entry(circuit.id().key().to_string()) {
            Entry::Occupied(entry) => Err(CircuitError::DuplicateCircuit(entry.key().clone())),
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(Arc::clone(circuit));
                Ok(key)
            }
        }
    }

    fn is_live(&self, circuit: &Arc<Circuit>) -> bool {
        self.inner
            .connected
            .get(circuit.id().key())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), circuit))
    }

    fn retain(&self, key: String, circuit: Arc<Circuit>) {
        CIRCUITS_DISCONNECTED.inc();
        self.inner
            .disconnected
            .set(key, circuit, self.inner.options.entry_cost);
    }
}

fn retention_ended(
    index: &CircuitIndex,
    observer: &dyn EvictionObserver,
    circuit: Arc<Circuit>,
    reason: EvictionReason,
) {
    CIRCUITS_DISCONNECTED.dec();
    if matches!(reason, EvictionReason::Removed | EvictionReason::Replaced) {
        return;
    }
    index.remove_if(circuit.id().key(), |_, known| Arc::ptr_eq(known, &circuit));

    CIRCUIT_EVICTIONS
        .with_label_values(&["circuits", reason.as_str()])
        .inc();
    info!(
        target = "circuit_host::registry",
        circuit = %circuit.id(),
        reason = reason.as_str(),
        "evicting disconnected circuit"
    );
    circuit.mark_closing();
    observer.circuit_evicted(circuit.id(), reason);

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { circuit.dispose().await });
        }
        Err(_) => warn!(
            target = "circuit_host::registry",
            circuit = %circuit.id(),
            "no runtime available to dispose evicted circuit"
        ),
    }
}
