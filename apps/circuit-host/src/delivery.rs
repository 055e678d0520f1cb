//! Ordered outbound batch delivery with cumulative acknowledgement.
//!
//! Every batch stays in the pending buffer until the peer acknowledges an id
//! at or above it. Binding a new channel bumps the channel generation; the
//! next flush notices the change and replays the pending buffer from the
//! oldest unacknowledged batch, so a given channel sees each id at most once
//! and always in ascending order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CircuitError;
use crate::fault::FaultReporter;
use crate::metrics::BATCH_EVENTS;
use crate::transport::{ChannelHandle, ConnectionToken};

pub const DEFAULT_FIRST_BATCH_ID: u64 = 1;
pub const DEFAULT_MAX_UNACKED_BATCHES: usize = 10;

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub first_batch_id: u64,
    /// Pending depth above which a backpressure warning is raised. Enqueue
    /// never refuses work.
    pub max_unacked_batches: usize,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            first_batch_id: DEFAULT_FIRST_BATCH_ID,
            max_unacked_batches: DEFAULT_MAX_UNACKED_BATCHES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    /// Batches are pending but no channel is bound.
    Producing,
    AwaitingDelivery(ConnectionToken),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Released { count: usize, highest_acked: u64 },
    Duplicate { highest_acked: u64 },
}

struct PendingBatch {
    id: u64,
    payload: Bytes,
}

struct QueueState {
    channel: Option<ChannelHandle>,
    generation: u64,
    pending: VecDeque<PendingBatch>,
    next_id: u64,
    highest_acked: u64,
    over_limit: bool,
    closed: bool,
}

impl QueueState {
    fn last_produced(&self) -> u64 {
        self.next_id - 1
    }
}

struct SendCursor {
    generation: u64,
    next_to_send: u64,
    /// Highest batch id any channel has accepted.
    highest_sent: u64,
    stalled: bool,
}

pub struct AckedDeliveryQueue {
    state: Mutex<QueueState>,
    cursor: tokio::sync::Mutex<SendCursor>,
    redelivered: AtomicU64,
    options: DeliveryOptions,
    faults: FaultReporter,
}

impl AckedDeliveryQueue {
    pub fn new(options: DeliveryOptions, faults: FaultReporter) -> Self {
        let origin = options.first_batch_id.max(1);
        Self {
            state: Mutex::new(QueueState {
                channel: None,
                generation: 0,
                pending: VecDeque::new(),
                next_id: origin,
                highest_acked: origin - 1,
                over_limit: false,
                closed: false,
            }),
            cursor: tokio::sync::Mutex::new(SendCursor {
                generation: 0,
                next_to_send: origin,
                highest_sent: origin - 1,
                stalled: false,
            }),
            redelivered: AtomicU64::new(0),
            options,
            faults,
        }
    }

    /// Appends a batch and, if a channel is bound, sends everything not yet
    /// sent on it. The batch is buffered before this returns even when the
    /// send is still in flight.
    pub async fn enqueue(&self, payload: Bytes) -> Result<u64, CircuitError> {
        let batch_id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CircuitError::Disposed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push_back(PendingBatch { id, payload });
            let depth = state.pending.len();
            if depth > self.options.max_unacked_batches && !state.over_limit {
                state.over_limit = true;
                BATCH_EVENTS.with_label_values(&["backpressure"]).inc();
                warn!(
                    target = "circuit_host::delivery",
                    circuit = %self.faults.circuit(),
                    depth,
                    limit = self.options.max_unacked_batches,
                    "unacknowledged batches above limit"
                );
            }
            id
        };
        BATCH_EVENTS.with_label_values(&["enqueued"]).inc();
        debug!(
            target = "circuit_host::delivery",
            circuit = %self.faults.circuit(),
            batch_id,
            "batch enqueued"
        );
        self.flush().await;
        Ok(batch_id)
    }

    /// Applies a cumulative acknowledgement.
    ///
    /// An id past the last produced batch is a protocol violation and is
    /// returned as a fatal error with no state change. Ids at or below the
    /// highest acknowledged id are ignored.
    pub fn acknowledge(
        &self,
        batch_id: u64,
        error: Option<String>,
    ) -> Result<AckOutcome, CircuitError> {
        let outcome = {
            let mut state = self.state.lock();
            let last_produced = state.last_produced();
            if batch_id > last_produced {
                return Err(CircuitError::AckBeyondRange {
                    batch_id,
                    last_produced,
                });
            }
            if batch_id <= state.highest_acked {
                AckOutcome::Duplicate {
                    highest_acked: state.highest_acked,
                }
            } else {
                let mut count = 0;
                while state.pending.front().is_some_and(|b| b.id <= batch_id) {
                    state.pending.pop_front();
                    count += 1;
                }
                state.highest_acked = batch_id;
                if state.pending.len() <= self.options.max_unacked_batches {
                    state.over_limit = false;
                }
                AckOutcome::Released {
                    count,
                    highest_acked: batch_id,
                }
            }
        };

        match outcome {
            AckOutcome::Released { count, .. } => {
                BATCH_EVENTS
                    .with_label_values(&["acked"])
                    .inc_by(count as u64);
                debug!(
                    target = "circuit_host::delivery",
                    circuit = %self.faults.circuit(),
                    batch_id,
                    released = count,
                    "batches acknowledged"
                );
                if let Some(message) = error {
                    self.faults
                        .report(CircuitError::ClientBatchError { batch_id, message });
                }
            }
            AckOutcome::Duplicate { highest_acked } => {
                debug!(
                    target = "circuit_host::delivery",
                    circuit = %self.faults.circuit(),
                    batch_id,
                    highest_acked,
                    "ignoring duplicate acknowledgement"
                );
            }
        }
        Ok(outcome)
    }

    /// Binds `channel` and replays every pending batch onto it.
    pub async fn rebind_channel(&self, channel: ChannelHandle) {
        self.swap_channel(channel);
        self.flush().await;
    }

    /// Binds `channel` without sending. The next `flush` replays from the
    /// oldest unacknowledged batch. Returns the previously bound channel.
    pub fn swap_channel(&self, channel: ChannelHandle) -> Option<ChannelHandle> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let connection = channel.connection();
        let previous = state.channel.replace(channel);
        state.generation += 1;
        let pending = state.pending.len();
        drop(state);

        debug!(
            target = "circuit_host::delivery",
            circuit = %self.faults.circuit(),
            connection = %connection,
            pending,
            "channel rebound"
        );
        previous
    }

    pub fn detach_channel(&self) -> Option<ChannelHandle> {
        let mut state = self.state.lock();
        state.generation += 1;
        state.channel.take()
    }

    /// Sends every pending batch the bound channel has not yet seen.
    pub async fn flush(&self) {
        let mut cursor = self.cursor.lock().await;
        loop {
            let (channel, batch_id, payload) = {
                let state = self.state.lock();
                let Some(channel) = state.channel.clone() else {
                    return;
                };
                if cursor.generation != state.generation {
                    cursor.generation = state.generation;
                    cursor.next_to_send = state.highest_acked + 1;
                    cursor.stalled = false;
                }
                if cursor.stalled {
                    return;
                }
                let from = cursor.next_to_send.max(state.highest_acked + 1);
                let Some(front) = state.pending.front() else {
                    return;
                };
                let offset = from.saturating_sub(front.id) as usize;
                let Some(batch) = state.pending.get(offset) else {
                    return;
                };
                (channel, batch.id, batch.payload.clone())
            };

            match channel.send_batch(batch_id, payload).await {
                Ok(()) => {
                    cursor.next_to_send = batch_id + 1;
                    if batch_id <= cursor.highest_sent {
                        self.redelivered.fetch_add(1, Ordering::Relaxed);
                        BATCH_EVENTS.with_label_values(&["redelivered"]).inc();
                    } else {
                        cursor.highest_sent = batch_id;
                        BATCH_EVENTS.with_label_values(&["sent"]).inc();
                    }
                }
                Err(err) => {
                    cursor.stalled = true;
                    BATCH_EVENTS.with_label_values(&["send_failed"]).inc();
                    warn!(
                        target = "circuit_host::delivery",
                        circuit = %self.faults.circuit(),
                        connection = %channel.connection(),
                        batch_id,
                        error = %err,
                        "batch send failed; holding for next channel"
                    );
                    if err.is_unusable() {
                        self.faults
                            .report(CircuitError::TransportUnusable(err.to_string()));
                    }
                    return;
                }
            }
        }
    }

    /// Drops every pending batch and refuses further work.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        state.channel = None;
        state.generation += 1;
        let released = state.pending.len();
        state.pending.clear();
        released
    }

    pub fn state(&self) -> DeliveryState {
        let state = self.state.lock();
        match (&state.channel, state.pending.is_empty()) {
            (_, true) => DeliveryState::Idle,
            (None, false) => DeliveryState::Producing,
            (Some(channel), false) => DeliveryState::AwaitingDelivery(channel.connection()),
        }
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        self.state.lock().channel.clone()
    }

    pub fn connection(&self) -> Option<ConnectionToken> {
        self.state.lock().channel.as_ref().map(|c| c.connection())
    }

    pub fn last_produced_batch_id(&self) -> u64 {
        self.state.lock().last_produced()
    }

    pub fn highest_acked_batch_id(&self) -> u64 {
        self.state.lock().highest_acked
    }

    pub fn pending_batch_ids(&self) -> Vec<u64> {
        self.state.lock().pending.iter().map(|b| b.id).collect()
    }

    /// Batches sent again after a channel change.
    pub fn redelivered_batches(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitIdFactory;
    use crate::fault::RecordingFaultSink;
    use crate::transport::mock::RecordingChannel;
    use crate::transport::{ClientChannel, TransportError};
    use std::sync::Arc;

    fn queue(max: usize) -> (Arc<AckedDeliveryQueue>, Arc<RecordingFaultSink>) {
        let sink = RecordingFaultSink::new();
        let id = CircuitIdFactory::random().create();
        let queue = AckedDeliveryQueue::new(
            DeliveryOptions {
                first_batch_id: 1,
                max_unacked_batches: max,
            },
            FaultReporter::new(id, sink.clone()),
        );
        (Arc::new(queue), sink)
    }

    async fn produce(queue: &AckedDeliveryQueue, n: usize) -> Vec<u64> {
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(
                queue
                    .enqueue(Bytes::from(format!("batch-{i}")))
                    .await
                    .unwrap(),
            );
        }
        ids
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn ids_increase_from_origin_without_gaps() {
        let (queue, _) = queue(10);
        assert_eq!(produce(&queue, 4).await, vec![1, 2, 3, 4]);
        assert_eq!(queue.last_produced_batch_id(), 4);
        assert_eq!(queue.state(), DeliveryState::Producing);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn custom_origin_is_honoured() {
        let sink = RecordingFaultSink::new();
        let queue = AckedDeliveryQueue::new(
            DeliveryOptions {
                first_batch_id: 40,
                max_unacked_batches: 10,
            },
            FaultReporter::new(CircuitIdFactory::random().create(), sink),
        );
        assert_eq!(produce(&queue, 2).await, vec![40, 41]);
        assert_eq!(queue.highest_acked_batch_id(), 39);
        assert!(matches!(
            queue.acknowledge(39, None),
            Ok(AckOutcome::Duplicate { highest_acked: 39 })
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn cumulative_ack_releases_exactly_the_prefix() {
        for k in 1..=5u64 {
            let (queue, _) = queue(10);
            produce(&queue, 5).await;
            let outcome = queue.acknowledge(k, None).unwrap();
            assert_eq!(
                outcome,
                AckOutcome::Released {
                    count: k as usize,
                    highest_acked: k
                }
            );
            let expected: Vec<u64> = (k + 1..=5).collect();
            assert_eq!(queue.pending_batch_ids(), expected);
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn ack_beyond_last_produced_is_fatal_and_changes_nothing() {
        let (queue, _) = queue(10);
        let err = queue.acknowledge(1, None).unwrap_err();
        assert!(err.is_fatal());

        produce(&queue, 3).await;
        queue.acknowledge(1, None).unwrap();
        let err = queue.acknowledge(4, None).unwrap_err();
        assert_eq!(
            err,
            CircuitError::AckBeyondRange {
                batch_id: 4,
                last_produced: 3
            }
        );
        assert_eq!(queue.pending_batch_ids(), vec![2, 3]);
        assert_eq!(queue.highest_acked_batch_id(), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn duplicate_ack_is_a_no_op() {
        let (once, _) = queue(10);
        let (twice, _) = queue(10);
        produce(&once, 3).await;
        produce(&twice, 3).await;

        once.acknowledge(2, None).unwrap();
        twice.acknowledge(2, None).unwrap();
        assert_eq!(
            twice.acknowledge(2, None).unwrap(),
            AckOutcome::Duplicate { highest_acked: 2 }
        );
        assert_eq!(twice.acknowledge(1, None).unwrap(), AckOutcome::Duplicate { highest_acked: 2 });

        assert_eq!(once.pending_batch_ids(), twice.pending_batch_ids());
        assert_eq!(once.highest_acked_batch_id(), twice.highest_acked_batch_id());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn enqueue_sends_immediately_when_bound() {
        let (queue, _) = queue(10);
        let channel = RecordingChannel::new();
        queue.rebind_channel(channel.clone()).await;
        produce(&queue, 3).await;
        assert_eq!(channel.batch_ids(), vec![1, 2, 3]);
        assert_eq!(
            queue.state(),
            DeliveryState::AwaitingDelivery(channel.connection())
        );
        queue.acknowledge(3, None).unwrap();
        assert_eq!(queue.state(), DeliveryState::Idle);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn rebind_replays_exactly_the_unacked_batches_once() {
        let (queue, _) = queue(10);
        let first = RecordingChannel::new();
        queue.rebind_channel(first.clone()).await;
        produce(&queue, 5).await;
        queue.acknowledge(2, None).unwrap();

        let second = RecordingChannel::new();
        queue.rebind_channel(second.clone()).await;
        assert_eq!(second.batch_ids(), vec![3, 4, 5]);
        assert_eq!(first.batch_ids(), vec![1, 2, 3, 4, 5]);

        // a later flush must not resend anything
        queue.flush().await;
        assert_eq!(second.batch_ids(), vec![3, 4, 5]);

        produce(&queue, 1).await;
        assert_eq!(second.batch_ids(), vec![3, 4, 5, 6]);
        assert_eq!(second.batches()[3].1, Bytes::from("batch-0"));
        assert_eq!(queue.redelivered_batches(), 3);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn only_actual_resends_count_as_redelivered() {
        let (queue, _) = queue(10);
        produce(&queue, 3).await;

        let first = RecordingChannel::new();
        queue.rebind_channel(first.clone()).await;
        assert_eq!(first.batch_ids(), vec![1, 2, 3]);
        assert_eq!(queue.redelivered_batches(), 0);

        queue.acknowledge(3, None).unwrap();
        let second = RecordingChannel::new();
        queue.rebind_channel(second.clone()).await;
        assert!(second.batch_ids().is_empty());
        assert_eq!(queue.redelivered_batches(), 0);

        produce(&queue, 2).await;
        assert_eq!(second.batch_ids(), vec![4, 5]);

        // Swapping twice before a flush replays once.
        let third = RecordingChannel::new();
        let fourth = RecordingChannel::new();
        queue.swap_channel(third.clone());
        queue.swap_channel(fourth.clone());
        queue.flush().await;
        assert!(third.batch_ids().is_empty());
        assert_eq!(fourth.batch_ids(), vec![4, 5]);
        assert_eq!(queue.redelivered_batches(), 2);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn failed_send_keeps_batch_for_next_channel() {
        let (queue, faults) = queue(10);
        let broken = RecordingChannel::new();
        broken.fail_with(Some(TransportError::Closed));
        queue.rebind_channel(broken.clone()).await;
        produce(&queue, 2).await;
        assert!(broken.batch_ids().is_empty());
        assert_eq!(queue.pending_batch_ids(), vec![1, 2]);

        let errors = faults.errors();
        assert_eq!(errors.len(), 1, "stalled channel reports once: {errors:?}");
        assert!(matches!(errors[0], CircuitError::TransportUnusable(_)));
        assert!(!errors[0].is_fatal());

        let healthy = RecordingChannel::new();
        queue.rebind_channel(healthy.clone()).await;
        assert_eq!(healthy.batch_ids(), vec![1, 2]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn transient_send_failure_is_not_reported() {
        let (queue, faults) = queue(10);
        let channel = RecordingChannel::new();
        channel.fail_with(Some(TransportError::Timeout));
        queue.rebind_channel(channel.clone()).await;
        produce(&queue, 1).await;
        assert!(faults.errors().is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn ack_error_is_routed_to_fault_sink() {
        let (queue, faults) = queue(10);
        produce(&queue, 2).await;
        queue
            .acknowledge(2, Some("patch failed".to_string()))
            .unwrap();
        assert_eq!(
            faults.errors(),
            vec![CircuitError::ClientBatchError {
                batch_id: 2,
                message: "patch failed".to_string()
            }]
        );
        assert!(queue.pending_batch_ids().is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn enqueue_past_limit_still_buffers() {
        let (queue, _) = queue(2);
        produce(&queue, 5).await;
        assert_eq!(queue.pending_batch_ids(), vec![1, 2, 3, 4, 5]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn closed_queue_refuses_work() {
        let (queue, _) = queue(10);
        produce(&queue, 3).await;
        assert_eq!(queue.close(), 3);
        assert_eq!(
            queue.enqueue(Bytes::from_static(b"late")).await,
            Err(CircuitError::Disposed)
        );
        assert_eq!(queue.state(), DeliveryState::Idle);
    }

    #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueue_and_rebind_never_drops_or_duplicates() {
        let (queue, _) = queue(1_000);
        let first = RecordingChannel::new();
        queue.rebind_channel(first.clone()).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    queue
                        .enqueue(Bytes::from(format!("p{i}")))
                        .await
                        .unwrap();
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        let second = RecordingChannel::new();
        queue.rebind_channel(second.clone()).await;
        producer.await.unwrap();
        queue.flush().await;

        let ids = second.batch_ids();
        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(ids, expected);

        let first_ids = first.batch_ids();
        assert!(first_ids.windows(2).all(|w| w[0] < w[1]));
    }
}
