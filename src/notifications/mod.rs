//! Post-booking notifications.
//!
//! Booking creation only enqueues; delivery happens on a separate worker so a
//! slow or failing sink can never roll back or delay a booking.

use crate::message_queue::{Message, MessageQueue, MessageQueueError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const BOOKING_CONFIRMED_TOPIC: &str = "booking.confirmed";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Queue error: {0}")]
    Queue(#[from] MessageQueueError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Body of a `booking.confirmed` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub booking_id: String,
}

/// At-least-once, fire-and-forget hand-off after a booking commits
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn enqueue(&self, booking_id: &str) -> Result<(), NotificationError>;
}

/// Publishes `booking.confirmed` messages onto a [`MessageQueue`]
pub struct QueueNotificationDispatcher {
    queue: Arc<dyn MessageQueue>,
}

impl QueueNotificationDispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl NotificationDispatcher for QueueNotificationDispatcher {
    #[instrument(skip(self))]
    async fn enqueue(&self, booking_id: &str) -> Result<(), NotificationError> {
        let payload = serde_json::to_value(BookingConfirmed {
            booking_id: booking_id.to_string(),
        })?;
        self.queue
            .publish(Message::new(BOOKING_CONFIRMED_TOPIC, payload))
            .await?;
        debug!(booking_id, "Booking confirmation enqueued");
        Ok(())
    }
}

/// Final destination of a notification (email service, push, ...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &BookingConfirmed) -> Result<(), NotificationError>;
}

/// Sink that only records deliveries in the log
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn deliver(&self, event: &BookingConfirmed) -> Result<(), NotificationError> {
        info!(booking_id = %event.booking_id, "Booking confirmation ready for delivery");
        Ok(())
    }
}

/// Drains the notification queue into a sink
pub struct NotificationWorker {
    queue: Arc<dyn MessageQueue>,
    sink: Arc<dyn NotificationSink>,
    idle_interval: Duration,
}

impl NotificationWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            queue,
            sink,
            idle_interval: Duration::from_secs(1),
        }
    }

    /// Delivers everything currently queued; returns how many messages were delivered
    pub async fn drain_once(&self) -> Result<usize, NotificationError> {
        let mut delivered = 0;
        while let Some(message) = self.queue.subscribe(BOOKING_CONFIRMED_TOPIC).await? {
            let event: BookingConfirmed = match serde_json::from_value(message.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Dropping malformed notification");
                    continue;
                }
            };

            match self.sink.deliver(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => match message.retried() {
                    Some(retry) => {
                        warn!(booking_id = %event.booking_id, error = %e, attempt = retry.retry_count, "Notification delivery failed; requeued");
                        self.queue.publish(retry).await?;
                        // Leave the retry for the next tick instead of spinning on it
                        break;
                    }
                    None => {
                        error!(booking_id = %event.booking_id, error = %e, "Notification delivery abandoned after retries");
                    }
                },
            }
        }
        Ok(delivered)
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Notification worker started");
            let mut ticker = tokio::time::interval(self.idle_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.drain_once().await {
                            error!(error = %e, "Notification drain failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            match self.drain_once().await {
                                Ok(delivered) => debug!(delivered, "Final notification drain"),
                                Err(e) => error!(error = %e, "Final notification drain failed"),
                            }
                            break;
                        }
                    }
                }
            }
            info!("Notification worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_queue::InMemoryMessageQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySink {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver(&self, _event: &BookingConfirmed) -> Result<(), NotificationError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NotificationError::Delivery("smtp down".into()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueued_bookings_reach_the_sink_after_a_retry() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
        let dispatcher = QueueNotificationDispatcher::new(queue.clone());
        dispatcher.enqueue("BK-0000ABCD").await.unwrap();

        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(1),
            delivered: AtomicUsize::new(0),
        });
        let worker = NotificationWorker::new(queue.clone(), sink.clone());

        assert_eq!(worker.drain_once().await.unwrap(), 0);
        assert_eq!(worker.drain_once().await.unwrap(), 1);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(BOOKING_CONFIRMED_TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_delivers_what_is_still_queued() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
        let dispatcher = QueueNotificationDispatcher::new(queue.clone());
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = NotificationWorker::new(queue.clone(), sink.clone()).start(stop_rx);
        // let the immediate first tick pass so only the final drain can deliver
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.enqueue("BK-0000ABCD").await.unwrap();

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(BOOKING_CONFIRMED_TOPIC).await.unwrap(), 0);
    }
}
