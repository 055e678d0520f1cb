use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use circuit_host::cache::EvictionReason;
use circuit_host::registry::{EvictionObserver, TransitionInterceptor};
use circuit_host::transport::mock::RecordingChannel;
use circuit_host::{
    CircuitHandler, CircuitHub, CircuitId, CircuitOptions, CircuitPresence, ClientChannel,
};
use parking_lot::Mutex;
use tokio::sync::Barrier;

/// Stalls every transition while it holds the circuit lock.
struct SlowTransitions {
    delay: Duration,
}

#[async_trait]
impl TransitionInterceptor for SlowTransitions {
    async fn connect_locked(&self, _circuit: &CircuitId) {
        tokio::time::sleep(self.delay).await;
    }

    async fn disconnect_locked(&self, _circuit: &CircuitId) {
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Default)]
struct Evictions(Mutex<Vec<EvictionReason>>);

impl EvictionObserver for Evictions {
    fn circuit_evicted(&self, _circuit: &CircuitId, reason: EvictionReason) {
        self.0.lock().push(reason);
    }
}

#[derive(Default)]
struct Transitions {
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl CircuitHandler for Transitions {
    async fn on_connection_up(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        self.calls.lock().push("up");
        Ok(())
    }

    async fn on_connection_down(&self, _circuit: &CircuitId) -> anyhow::Result<()> {
        self.calls.lock().push("down");
        Ok(())
    }
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disconnect_and_reconnect_leave_one_live_circuit() {
    for _ in 0..50 {
        let handler = Arc::new(Transitions::default());
        let hub = CircuitHub::builder(CircuitOptions::default())
            .handler(handler.clone() as Arc<dyn CircuitHandler>)
            .build();
        let first = RecordingChannel::new();
        let circuit = hub.start_circuit(first.clone()).await.unwrap();
        let token = circuit.id().token().to_string();
        let second = RecordingChannel::new();
        let barrier = Arc::new(Barrier::new(2));

        let disconnect = tokio::spawn({
            let (hub, barrier, connection) = (hub.clone(), barrier.clone(), first.connection());
            async move {
                barrier.wait().await;
                hub.connection_closed(connection).await
            }
        });
        let reconnect = tokio::spawn({
            let (hub, barrier, channel) = (hub.clone(), barrier.clone(), second.clone());
            async move {
                barrier.wait().await;
                hub.connect_circuit(&token, channel).await.is_some()
            }
        });
        disconnect.await.unwrap();
        assert!(reconnect.await.unwrap());

        // Whichever side won the lock, the second channel ends up bound.
        assert_eq!(
            hub.registry().presence(circuit.id()).await,
            CircuitPresence::Connected
        );
        assert_eq!(circuit.connection(), Some(second.connection()));
        assert_eq!(hub.registry().connected_count(), 1);
        assert_eq!(hub.registry().disconnected_count(), 0);
        assert_eq!(handler.calls.lock().last(), Some(&"up"));
        hub.shutdown();
    }
}

#[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
async fn observers_never_see_a_circuit_in_both_sets_or_neither() {
    let evictions = Arc::new(Evictions::default());
    let hub = CircuitHub::builder(CircuitOptions::default())
        .registry_instrumentation(
            Arc::new(SlowTransitions {
                delay: Duration::from_millis(2),
            }),
            evictions.clone(),
        )
        .build();
    let first = RecordingChannel::new();
    let circuit = hub.start_circuit(first.clone()).await.unwrap();
    let id = circuit.id().clone();
    let token = id.token().to_string();

    let done = Arc::new(AtomicBool::new(false));
    let observer = tokio::spawn({
        let (hub, done, id) = (hub.clone(), done.clone(), id.clone());
        async move {
            let mut samples = 0usize;
            while !done.load(Ordering::Acquire) {
                let presence = hub.registry().presence(&id).await;
                assert_ne!(presence, CircuitPresence::Absent);
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        }
    });

    let mut current = first;
    for _ in 0..40 {
        let next = RecordingChannel::new();
        let closed = tokio::spawn({
            let (hub, connection) = (hub.clone(), current.connection());
            async move { hub.connection_closed(connection).await }
        });
        let connected = tokio::spawn({
            let (hub, token, channel) = (hub.clone(), token.clone(), next.clone());
            async move { hub.connect_circuit(&token, channel).await.is_some() }
        });
        closed.await.unwrap();
        assert!(connected.await.unwrap());
        current = next;
    }

    done.store(true, Ordering::Release);
    assert!(observer.await.unwrap() > 0);
    assert_eq!(
        hub.registry().presence(&id).await,
        CircuitPresence::Connected
    );
    assert!(evictions.0.lock().is_empty());
}
