//! Transmit channel - non-blocking delivery of responses to the dispatcher.
//!
//! Handlers never wait on the bus. A [`TransmitHandle`] pushes messages
//! onto a bounded queue and returns; a pump task drains the queue and
//! spawns one delivery task per message, with at most `max_in_flight`
//! deliveries running at once.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐                                        ┌─► delivery ─► Dispatcher1.Transmit
//! Handler 2 ─┼─► mpsc::Sender<OutboundMessage> ─► Pump ┼─► delivery ─► Dispatcher1.Transmit
//! Handler N ─┘                                        └─► (≤ max_in_flight)
//! ```
//!
//! Delivery is at-most-once: a failed or timed-out call is logged and
//! counted, never retried and never reported to the handler.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bus::BusSession;
use crate::error::{Result, WorkerError};
use crate::message::OutboundMessage;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default maximum concurrent deliveries.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default timeout of a single Transmit call (the D-Bus default reply timeout).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Default time `send` waits for queue space.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the transmit channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitConfig {
    /// Messages buffered before `transmit` reports backpressure.
    pub queue_capacity: usize,
    /// Deliveries allowed to run concurrently.
    pub max_in_flight: usize,
    /// Upper bound for one outbound Transmit call.
    pub call_timeout: Duration,
    /// How long `send` waits for queue space.
    pub enqueue_timeout: Duration,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the transmit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmitStats {
    /// Waiting in the queue.
    pub queued: usize,
    /// Delivery running.
    pub in_flight: usize,
    /// Accepted by the dispatcher.
    pub delivered: u64,
    /// Failed or timed out.
    pub failed: u64,
}

impl TransmitStats {
    /// Deliveries that have finished, successfully or not.
    pub fn completed(&self) -> u64 {
        self.delivered + self.failed
    }
}

/// Handle for scheduling outbound messages.
///
/// Cheaply cloneable and shared by every dispatch context.
#[derive(Clone)]
pub struct TransmitHandle {
    tx: mpsc::Sender<OutboundMessage>,
    counters: Arc<Counters>,
    enqueue_timeout: Duration,
}

impl TransmitHandle {
    /// Schedule a message and return immediately.
    ///
    /// Returns `Err(Backpressure)` if the queue is full and
    /// `Err(ChannelClosed)` once the worker is shutting down. The outcome
    /// of the delivery itself is never reported here.
    pub fn transmit(&self, message: OutboundMessage) -> Result<()> {
        let message_id = message.message_id.clone();
        self.counters.queued.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(message).map_err(|e| {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(message_id = %message_id, "Transmit queue full, message not scheduled");
                    WorkerError::Backpressure
                }
                mpsc::error::TrySendError::Closed(_) => WorkerError::ChannelClosed,
            }
        })
    }

    /// Schedule a message, waiting for queue space if necessary.
    ///
    /// Waits at most the configured enqueue timeout, then returns
    /// `Err(Backpressure)`.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.counters.queued.fetch_add(1, Ordering::AcqRel);

        self.tx
            .send_timeout(message, self.enqueue_timeout)
            .await
            .map_err(|e| {
                self.counters.queued.fetch_sub(1, Ordering::AcqRel);
                match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => WorkerError::Backpressure,
                    mpsc::error::SendTimeoutError::Closed(_) => WorkerError::ChannelClosed,
                }
            })
    }

    /// Current counters.
    pub fn stats(&self) -> TransmitStats {
        TransmitStats {
            queued: self.counters.queued.load(Ordering::Acquire),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            delivered: self.counters.delivered.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
        }
    }

    /// Check if the queue currently rejects `transmit`.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.tx.capacity() == 0
    }
}

/// Receiving half of the transmit channel, started once a bus session exists.
pub struct TransmitQueue {
    rx: mpsc::Receiver<OutboundMessage>,
    counters: Arc<Counters>,
    max_in_flight: usize,
    call_timeout: Duration,
}

/// Create a transmit channel.
///
/// The handle can be used right away; messages stay queued until
/// [`TransmitQueue::spawn`] starts delivering them.
pub fn transmit_channel(config: &TransmitConfig) -> (TransmitHandle, TransmitQueue) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let counters = Arc::new(Counters::default());

    let handle = TransmitHandle {
        tx,
        counters: counters.clone(),
        enqueue_timeout: config.enqueue_timeout,
    };
    let queue = TransmitQueue {
        rx,
        counters,
        max_in_flight: config.max_in_flight.max(1),
        call_timeout: config.call_timeout,
    };

    (handle, queue)
}

impl TransmitQueue {
    /// Spawn the pump task delivering through `session`.
    ///
    /// When `shutdown` fires the queue stops accepting messages, already
    /// queued messages are still delivered, and the task ends after the
    /// last in-flight delivery.
    pub fn spawn(self, session: Arc<dyn BusSession>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(pump(self, session, shutdown))
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<OutboundMessage> {
        let message = self.rx.try_recv().ok()?;
        self.counters.queued.fetch_sub(1, Ordering::AcqRel);
        Some(message)
    }
}

async fn pump(queue: TransmitQueue, session: Arc<dyn BusSession>, shutdown: CancellationToken) {
    let TransmitQueue {
        mut rx,
        counters,
        max_in_flight,
        call_timeout,
    } = queue;

    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut deliveries = JoinSet::new();
    let mut closing = false;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled(), if !closing => {
                tracing::debug!("Transmit queue closing");
                rx.close();
                closing = true;
                continue;
            }
            next = rx.recv() => next,
        };

        let Some(message) = next else { break };
        counters.queued.fetch_sub(1, Ordering::AcqRel);

        let permit = match permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let guard = InFlightGuard::new(counters.clone(), permit);
        deliveries.spawn(deliver(session.clone(), message, call_timeout, guard));

        // Reap finished deliveries so the set does not grow unbounded
        while let Some(done) = deliveries.try_join_next() {
            log_join_error(done);
        }
    }

    while let Some(done) = deliveries.join_next().await {
        log_join_error(done);
    }
    tracing::debug!("Transmit pump stopped");
}

/// Perform one outbound Transmit call.
async fn deliver(
    session: Arc<dyn BusSession>,
    message: OutboundMessage,
    call_timeout: Duration,
    guard: InFlightGuard,
) {
    tracing::debug!(
        address = %message.address,
        message_id = %message.message_id,
        response_to = %message.response_to,
        "Transmitting"
    );

    let outcome = match tokio::time::timeout(call_timeout, session.transmit(&message)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(WorkerError::TransmitFailure(format!(
            "no reply within {:?}",
            call_timeout
        ))),
    };

    match outcome {
        Ok(result) => {
            guard.counters.delivered.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(
                message_id = %message.message_id,
                code = result.code,
                "Transmitted"
            );
        }
        Err(e) => {
            guard.counters.failed.fetch_add(1, Ordering::AcqRel);
            tracing::error!(message_id = %message.message_id, "Transmit failed: {}", e);
        }
    }
}

fn log_join_error(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            tracing::error!("Transmit delivery panicked");
        }
    }
}

/// Holds a delivery slot and keeps `in_flight` accurate, even on panic.
struct InFlightGuard {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl InFlightGuard {
    fn new(counters: Arc<Counters>, permit: OwnedSemaphorePermit) -> Self {
        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            counters,
            _permit: permit,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::message::{Metadata, TransmitResult, WorkerEvent};
    use crate::properties::PropertiesChanged;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Session whose transmit behaviour is chosen per message id.
    #[derive(Default)]
    struct ScriptedSession {
        fail: HashSet<String>,
        hang: HashSet<String>,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BusSession for ScriptedSession {
        async fn transmit(&self, message: &OutboundMessage) -> Result<TransmitResult> {
            if self.hang.contains(&message.message_id) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(&message.message_id) {
                return Err(WorkerError::TransmitFailure("dispatcher unreachable".into()));
            }
            self.delivered.lock().push(message.message_id.clone());
            Ok(TransmitResult::default())
        }

        async fn emit_event(&self, _event: &WorkerEvent) -> Result<()> {
            Ok(())
        }

        async fn emit_properties_changed(&self, _change: &PropertiesChanged) -> Result<()> {
            Ok(())
        }

        async fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    fn message(id: &str) -> OutboundMessage {
        OutboundMessage::new("addr", id, "m0", Metadata::new(), Bytes::from_static(b"payload"))
    }

    async fn wait_completed(handle: &TransmitHandle, n: u64) {
        for _ in 0..200 {
            if handle.stats().completed() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("deliveries did not complete: {:?}", handle.stats());
    }

    #[test]
    fn test_config_default() {
        let config = TransmitConfig::default();
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.enqueue_timeout, DEFAULT_ENQUEUE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_transmit_before_spawn_is_queued() {
        let (handle, mut queue) = transmit_channel(&TransmitConfig::default());
        handle.transmit(message("m1")).unwrap();

        assert_eq!(handle.stats().queued, 1);
        assert_eq!(queue.try_next().unwrap().message_id, "m1");
        assert_eq!(handle.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_transmit_full_queue() {
        let config = TransmitConfig {
            queue_capacity: 2,
            ..TransmitConfig::default()
        };
        let (handle, _queue) = transmit_channel(&config);

        handle.transmit(message("m1")).unwrap();
        handle.transmit(message("m2")).unwrap();
        assert!(handle.is_backpressure_active());

        let result = handle.transmit(message("m3"));
        assert!(matches!(result, Err(WorkerError::Backpressure)));
        assert_eq!(handle.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_send_times_out_on_full_queue() {
        let config = TransmitConfig {
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(10),
            ..TransmitConfig::default()
        };
        let (handle, _queue) = transmit_channel(&config);

        handle.send(message("m1")).await.unwrap();
        let result = handle.send(message("m2")).await;
        assert!(matches!(result, Err(WorkerError::Backpressure)));
    }

    #[tokio::test]
    async fn test_transmit_after_close() {
        let (handle, queue) = transmit_channel(&TransmitConfig::default());
        drop(queue);
        assert!(matches!(
            handle.transmit(message("m1")),
            Err(WorkerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_failures_are_independent() {
        let session = Arc::new(ScriptedSession {
            fail: ["m2".to_string(), "m4".to_string()].into_iter().collect(),
            ..ScriptedSession::default()
        });
        let (handle, queue) = transmit_channel(&TransmitConfig::default());
        let _task = queue.spawn(session.clone(), CancellationToken::new());

        for i in 1..=5 {
            handle.transmit(message(&format!("m{}", i))).unwrap();
        }
        wait_completed(&handle, 5).await;

        let stats = handle.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.failed, 2);

        let mut delivered = session.delivered.lock().clone();
        delivered.sort();
        assert_eq!(delivered, vec!["m1", "m3", "m5"]);
    }

    #[tokio::test]
    async fn test_hung_delivery_does_not_block_others() {
        let session = Arc::new(ScriptedSession {
            hang: ["stuck".to_string()].into_iter().collect(),
            ..ScriptedSession::default()
        });
        let (handle, queue) = transmit_channel(&TransmitConfig::default());
        let _task = queue.spawn(session.clone(), CancellationToken::new());

        handle.transmit(message("stuck")).unwrap();
        handle.transmit(message("m1")).unwrap();
        handle.transmit(message("m2")).unwrap();
        wait_completed(&handle, 2).await;

        assert_eq!(handle.stats().in_flight, 1);
        assert_eq!(session.delivered.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let session = Arc::new(ScriptedSession {
            hang: ["stuck".to_string()].into_iter().collect(),
            ..ScriptedSession::default()
        });
        let config = TransmitConfig {
            call_timeout: Duration::from_millis(20),
            ..TransmitConfig::default()
        };
        let (handle, queue) = transmit_channel(&config);
        let _task = queue.spawn(session, CancellationToken::new());

        handle.transmit(message("stuck")).unwrap();
        wait_completed(&handle, 1).await;

        let stats = handle.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_in_flight_is_bounded() {
        let hang: HashSet<String> = (0..4).map(|i| format!("h{}", i)).collect();
        let session = Arc::new(ScriptedSession {
            hang,
            ..ScriptedSession::default()
        });
        let config = TransmitConfig {
            max_in_flight: 2,
            ..TransmitConfig::default()
        };
        let (handle, queue) = transmit_channel(&config);
        let _task = queue.spawn(session, CancellationToken::new());

        for i in 0..4 {
            handle.transmit(message(&format!("h{}", i))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = handle.stats();
        assert_eq!(stats.in_flight, 2);
        // One is held by the pump waiting for a slot, one is still queued
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let session = Arc::new(ScriptedSession::default());
        let (handle, queue) = transmit_channel(&TransmitConfig::default());

        for i in 0..3 {
            handle.transmit(message(&format!("m{}", i))).unwrap();
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let task = queue.spawn(session.clone(), shutdown);
        task.await.unwrap();

        assert_eq!(session.delivered.lock().len(), 3);
        assert!(matches!(
            handle.transmit(message("late")),
            Err(WorkerError::ChannelClosed)
        ));
    }
}
