// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound delivery and outbound publishing.
//!
//! ```text
//! transport read loop ──► MessageCallback(generation) ──► DeliveryQueue
//!                                                            │
//!                                   Inbox::recv / consumer pump ◄┘
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::ConnectionSupervisor;
use super::queue::{DeliveryQueue, Inbox};
use crate::error::PublishError;
use crate::event::EventLog;
use crate::transport::{Connection, InboundMessage, MessageCallback, Transport};

/// Routes inbound messages to the consumer and publishes outbound ones.
pub struct MessageRouter<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    log: EventLog,
    queue: Arc<DeliveryQueue>,
    publish_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> MessageRouter<T> {
    /// Creates a router buffering up to `capacity` inbound messages.
    pub fn new(supervisor: Arc<ConnectionSupervisor<T>>, log: EventLog, capacity: usize) -> Self {
        Self {
            supervisor,
            log,
            queue: Arc::new(DeliveryQueue::new(capacity)),
            publish_lock: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
        }
    }

    /// Returns the consumer side of the inbound queue.
    #[must_use]
    pub fn inbox(&self) -> Inbox {
        Inbox::new(Arc::clone(&self.queue))
    }

    /// Number of inbound messages dropped because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Invokes `consumer` for every inbound message, in arrival order.
    ///
    /// Spawns a delivery task on the current Tokio runtime; a previously
    /// registered consumer is replaced. The consumer runs off the transport
    /// read loop, so a slow consumer only causes drops, never stalls.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn set_consumer<F>(&self, consumer: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let inbox = self.inbox();
        let task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                consumer(message);
            }
        });
        if let Some(previous) = self.pump.lock().replace(task) {
            previous.abort();
        }
    }

    /// Builds the transport callback for subscription `generation`.
    pub(crate) fn callback_for(&self, generation: u64) -> MessageCallback {
        let queue = Arc::clone(&self.queue);
        Arc::new(move |message: InboundMessage| {
            if !queue.push(generation, message) {
                tracing::trace!(generation, "Discarded message from retired subscription");
            }
        })
    }

    pub(crate) fn activate(&self, generation: u64) {
        self.queue.activate(generation);
    }

    pub(crate) fn retire(&self, generation: u64) {
        self.queue.retire(generation);
    }

    pub(crate) fn retire_active(&self) {
        self.queue.retire_active();
    }

    /// Logs a rejected publish and hands the error back.
    pub(crate) fn reject(&self, error: PublishError) -> PublishError {
        let text = match &error {
            PublishError::NotConnected => "Not connected to a broker.".to_string(),
            PublishError::EmptyPayload => "Enter a message to send.".to_string(),
            PublishError::NoTopic => "Select a topic before sending.".to_string(),
            PublishError::TransportError(e) => format!("Error while sending: {e}"),
        };
        tracing::debug!(error = %error, "Publish rejected");
        self.log.error(text);
        error
    }

    /// Publishes `payload` on `topic`.
    ///
    /// Returns once the transport accepted the message. Concurrent calls are
    /// sent one at a time.
    ///
    /// # Errors
    ///
    /// - [`PublishError::EmptyPayload`] if `payload` is empty
    /// - [`PublishError::NotConnected`] if there is no live connection
    /// - [`PublishError::TransportError`] if the transport refused the message
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), PublishError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(self.reject(PublishError::EmptyPayload));
        }
        let Some(connection) = self.supervisor.connection() else {
            return Err(self.reject(PublishError::NotConnected));
        };

        let _serialized = self.publish_lock.lock().await;
        match connection.publish(topic, payload.clone()).await {
            Ok(()) => {
                tracing::debug!(topic = %topic, bytes = payload.len(), "Message handed to transport");
                self.log
                    .info(format!("Sent: {}", String::from_utf8_lossy(&payload)));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Publish failed");
                Err(self.reject(PublishError::TransportError(e.to_string())))
            }
        }
    }

    /// Stops delivery: the consumer drains what is buffered, then ends.
    pub(crate) fn close(&self) {
        self.queue.close();
    }
}

impl<T: Transport> Drop for MessageRouter<T> {
    fn drop(&mut self) {
        if let Some(task) = self.pump.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::transport::{MemoryBroker, MemoryTransport};

    fn router(broker: &MemoryBroker, capacity: usize) -> MessageRouter<MemoryTransport> {
        let log = EventLog::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            broker.transport(),
            log.clone(),
            Duration::from_secs(5),
            ReconnectPolicy::disabled(),
        ));
        MessageRouter::new(supervisor, log, capacity)
    }

    #[tokio::test]
    async fn publish_empty_payload_fails_first() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 8);

        assert_eq!(router.publish("t", "").await, Err(PublishError::EmptyPayload));
        assert_eq!(router.log.snapshot()[0].text(), "Enter a message to send.");
    }

    #[tokio::test]
    async fn publish_while_disconnected_never_reaches_transport() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 8);

        assert_eq!(router.publish("t", "hi").await, Err(PublishError::NotConnected));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_while_connected_hands_to_transport() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 8);
        router.supervisor.connect("memory://local").await.unwrap();

        router.publish("orders", "hi").await.unwrap();

        assert_eq!(broker.published(), [("orders".to_string(), Bytes::from_static(b"hi"))]);
        assert!(router.log.snapshot().iter().any(|l| l.text() == "Sent: hi"));
    }

    #[tokio::test]
    async fn callback_only_accepts_active_generation() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 8);
        let old = router.callback_for(1);
        let new = router.callback_for(2);

        router.activate(1);
        old(InboundMessage::new("orders", "a"));
        router.retire(1);
        router.activate(2);
        old(InboundMessage::new("orders", "stale"));
        new(InboundMessage::new("alerts", "b"));

        let inbox = router.inbox();
        let texts: Vec<_> = std::iter::from_fn(|| inbox.try_recv())
            .map(|m| m.payload_str().into_owned())
            .collect();
        assert_eq!(texts, ["a", "b"]);
    }

    #[tokio::test]
    async fn consumer_receives_in_order() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        router.set_consumer(move |m| {
            let _ = tx.send(m.payload_str().into_owned());
        });

        router.activate(1);
        let callback = router.callback_for(1);
        for n in 0..5 {
            callback(InboundMessage::new("t", n.to_string()));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, ["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn close_ends_consumer() {
        let broker = MemoryBroker::new();
        let router = router(&broker, 4);
        router.close();
        assert!(router.inbox().recv().await.is_none());
    }
}
