use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{ClientChannel, ConnectionToken, TransportError};

/// In-memory channel that records everything sent through it.
pub struct RecordingChannel {
    connection: ConnectionToken,
    batches: Mutex<Vec<(u64, Bytes)>>,
    errors: Mutex<Vec<String>>,
    failure: Mutex<Option<TransportError>>,
    sent: Notify,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connection: ConnectionToken::new(),
            batches: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            sent: Notify::new(),
        })
    }

    pub fn batches(&self) -> Vec<(u64, Bytes)> {
        self.batches.lock().clone()
    }

    pub fn batch_ids(&self) -> Vec<u64> {
        self.batches.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Makes every following send fail with `failure`, or succeed again on `None`.
    pub fn fail_with(&self, failure: Option<TransportError>) {
        *self.failure.lock() = failure;
    }

    pub async fn wait_for_batches(&self, count: usize) {
        loop {
            let notified = self.sent.notified();
            if self.batches.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_errors(&self, count: usize) {
        loop {
            let notified = self.sent.notified();
            if self.errors.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn check(&self) -> Result<(), TransportError> {
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClientChannel for RecordingChannel {
    fn connection(&self) -> ConnectionToken {
        self.connection
    }

    async fn send_batch(&self, batch_id: u64, payload: Bytes) -> Result<(), TransportError> {
        self.check()?;
        self.batches.lock().push((batch_id, payload));
        self.sent.notify_waiters();
        Ok(())
    }

    async fn send_error(&self, message: &str) -> Result<(), TransportError> {
        self.check()?;
        self.errors.lock().push(message.to_string());
        self.sent.notify_waiters();
        Ok(())
    }
}
