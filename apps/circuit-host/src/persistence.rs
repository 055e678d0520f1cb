use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheOptions, EvictionCache, EvictionReason};
use crate::circuit::CircuitId;
use crate::metrics::CIRCUIT_EVICTIONS;

/// Application state captured when a circuit is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCircuitState {
    pub application_state: Bytes,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("paused circuit store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct PausedStoreOptions {
    pub max_retained: usize,
    pub retention: Duration,
    pub scan_interval: Duration,
}

impl Default for PausedStoreOptions {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            retention: Duration::from_secs(2 * 60 * 60),
            scan_interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
pub trait PausedCircuitStore: Send + Sync {
    /// Stores `state` for `circuit`. `ttl` overrides the store's retention.
    async fn persist(
        &self,
        circuit: &CircuitId,
        state: PersistedCircuitState,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError>;

    /// Takes the state for `circuit`, if any is still retained.
    async fn restore(
        &self,
        circuit: &CircuitId,
    ) -> Result<Option<PersistedCircuitState>, PersistenceError>;
}

/// Paused state held in process memory. Restoring removes the entry, so a
/// paused circuit can be resumed at most once.
pub struct InMemoryPausedCircuitStore {
    entries: EvictionCache<String, PersistedCircuitState>,
}

impl InMemoryPausedCircuitStore {
    pub fn new(options: PausedStoreOptions) -> Self {
        let entries = EvictionCache::new(
            "paused_circuits",
            CacheOptions {
                capacity: options.max_retained,
                ttl: options.retention,
                scan_interval: options.scan_interval,
            },
            Arc::new(|key: String, _state: PersistedCircuitState, reason: EvictionReason| {
                if matches!(reason, EvictionReason::Expired | EvictionReason::Capacity) {
                    CIRCUIT_EVICTIONS
                        .with_label_values(&["paused", reason.as_str()])
                        .inc();
                    debug!(
                        target = "circuit_host::persistence",
                        circuit = %key,
                        reason = reason.as_str(),
                        "paused circuit state dropped"
                    );
                }
            }),
        );
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PausedCircuitStore for InMemoryPausedCircuitStore {
    async fn persist(
        &self,
        circuit: &CircuitId,
        state: PersistedCircuitState,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        let ttl = ttl.unwrap_or(self.entries.options().ttl);
        self.entries
            .set_with_ttl(circuit.key().to_string(), state, 1, ttl);
        debug!(
            target = "circuit_host::persistence",
            circuit = %circuit,
            ttl_ms = ttl.as_millis() as u64,
            "paused circuit state stored"
        );
        Ok(())
    }

    async fn restore(
        &self,
        circuit: &CircuitId,
    ) -> Result<Option<PersistedCircuitState>, PersistenceError> {
        Ok(self.entries.remove(circuit.key()))
    }
}
