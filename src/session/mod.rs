// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The messaging session.
//!
//! A [`Session`] owns one broker connection, one topic subscription, the
//! inbound queue and the event log:
//!
//! ```text
//!                 Session
//!   ┌────────────────┬──────────────────┬───────────────┐
//!   │ Connection     │ SubscriptionSlot │ MessageRouter │
//!   │ Supervisor     │  (one topic)     │ (inbox/send)  │
//!   └───────┬────────┴────────┬─────────┴───────┬───────┘
//!           └──────────── EventLog ─────────────┘
//! ```
//!
//! # Examples
//!
//! ```
//! use subcon::transport::MemoryBroker;
//! use subcon::{ConnectionState, Session, SessionConfig};
//!
//! # async fn example() -> Result<(), subcon::Error> {
//! let broker = MemoryBroker::new();
//! let session = Session::new(broker.transport(), SessionConfig::default());
//!
//! session.connect("memory://local").await?;
//! assert_eq!(session.state(), ConnectionState::Connected);
//!
//! session.set_topic("orders").await?;
//! session.publish("order #1").await?;
//!
//! let received = session.inbox().recv().await.unwrap();
//! assert_eq!(received.payload_str(), "order #1");
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod queue;
mod router;
mod slot;
mod supervisor;

pub use queue::Inbox;
pub use router::MessageRouter;
pub use slot::SubscriptionSlot;
pub use supervisor::{ConnectionState, ConnectionSupervisor, LinkOutcome, ObserverId};

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::event::EventLog;
use crate::transport::{Connection, InboundMessage, Transport};

/// A single-topic messaging session over a [`Transport`].
///
/// Cloning a `Session` yields another handle to the same session.
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

struct SessionInner<T: Transport> {
    config: SessionConfig,
    log: EventLog,
    supervisor: Arc<ConnectionSupervisor<T>>,
    router: Arc<MessageRouter<T>>,
    slot: Arc<SubscriptionSlot<T>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let log = EventLog::with_capacity(config.log_capacity);
        let supervisor = Arc::new(ConnectionSupervisor::new(
            transport,
            log.clone(),
            config.connect_timeout,
            config.reconnect.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&supervisor),
            log.clone(),
            config.inbound_capacity,
        ));
        let slot = Arc::new(SubscriptionSlot::new(
            Arc::clone(&supervisor),
            Arc::clone(&router),
            log.clone(),
            config.subscribe_timeout,
        ));

        // Weak: the supervisor owns its observers and the slot owns the supervisor.
        let observer_slot = Arc::downgrade(&slot);
        supervisor.observe(move |previous, next| {
            if let Some(slot) = observer_slot.upgrade() {
                slot.on_transition(previous, next);
            }
        });

        Self {
            inner: Arc::new(SessionInner {
                config,
                log,
                supervisor,
                router,
                slot,
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Connects to `endpoint`, replacing any existing connection.
    ///
    /// If a topic was selected on a previous connection it is subscribed
    /// again on the new one. Link loss afterwards is handled in the
    /// background according to the [`ReconnectPolicy`](crate::ReconnectPolicy).
    ///
    /// # Errors
    ///
    /// See [`ConnectionSupervisor::connect`]. A failing resubscribe is only
    /// logged.
    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectError> {
        self.inner.supervisor.connect(endpoint).await?;
        self.spawn_watchdog();

        if let Err(e) = self.inner.slot.resubscribe().await {
            tracing::warn!(error = %e, "Could not restore subscription after connecting");
        }
        Ok(())
    }

    /// Subscribes to `topic`, replacing the current subscription.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionSlot::set_topic`].
    pub async fn set_topic(&self, topic: &str) -> Result<(), SubscribeError> {
        self.inner.slot.set_topic(topic).await
    }

    /// Publishes `payload` on the current topic.
    ///
    /// # Errors
    ///
    /// - [`PublishError::EmptyPayload`] if `payload` is empty
    /// - [`PublishError::NotConnected`] if the session is not connected
    /// - [`PublishError::NoTopic`] if no topic is selected
    /// - [`PublishError::TransportError`] if the transport refused the message
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<(), PublishError> {
        let payload = payload.into();
        let router = &self.inner.router;
        if payload.is_empty() {
            return Err(router.reject(PublishError::EmptyPayload));
        }
        if !self.state().is_connected() {
            return Err(router.reject(PublishError::NotConnected));
        }
        let Some(topic) = self.inner.slot.topic() else {
            return Err(router.reject(PublishError::NoTopic));
        };
        router.publish(&topic, payload).await
    }

    /// Publishes `payload` on an explicit `topic`.
    ///
    /// # Errors
    ///
    /// See [`MessageRouter::publish`].
    pub async fn publish_to(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), PublishError> {
        self.inner.router.publish(topic, payload).await
    }

    /// Disconnects and tears down the subscription. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.supervisor.disconnect().await;
        self.inner.slot.clear().await;
    }

    /// Disconnects and stops inbound delivery.
    ///
    /// [`Inbox::recv`] returns `None` once the buffered messages are drained.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Some(watchdog) = self.inner.watchdog.lock().take() {
            watchdog.abort();
        }
        self.inner.router.close();
        tracing::info!("Session shut down");
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Returns a receiver that observes state changes asynchronously.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.watch_state()
    }

    /// Registers a synchronous observer for state transitions.
    ///
    /// The observer runs before the call that caused the transition returns
    /// and must not call back into the session.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.supervisor.observe(observer)
    }

    /// Removes an observer registered with [`observe`](Self::observe).
    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.inner.supervisor.unobserve(id)
    }

    /// The session's event log.
    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Returns the consumer side of the inbound message queue.
    #[must_use]
    pub fn inbox(&self) -> Inbox {
        self.inner.router.inbox()
    }

    /// Invokes `consumer` for every inbound message.
    ///
    /// See [`MessageRouter::set_consumer`].
    pub fn set_consumer<F>(&self, consumer: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner.router.set_consumer(consumer);
    }

    /// Inbound messages dropped because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.router.dropped()
    }

    /// The currently selected topic.
    #[must_use]
    pub fn topic(&self) -> Option<String> {
        self.inner.slot.topic()
    }

    /// The endpoint of the live connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.supervisor.endpoint()
    }

    /// The configuration this session was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn spawn_watchdog(&self) {
        let task = tokio::spawn(watch_link(Arc::downgrade(&self.inner)));
        if let Some(previous) = self.inner.watchdog.lock().replace(task) {
            previous.abort();
        }
    }
}

/// Waits for the live link to close and drives reconnection.
async fn watch_link<T: Transport>(session: Weak<SessionInner<T>>) {
    loop {
        let Some((generation, connection)) = session
            .upgrade()
            .and_then(|inner| inner.supervisor.current_link())
        else {
            return;
        };

        connection.closed().await;
        drop(connection);

        let Some(inner) = session.upgrade() else {
            return;
        };
        match inner.supervisor.connection_lost(generation).await {
            LinkOutcome::Reconnected => {
                if let Err(e) = inner.slot.resubscribe().await {
                    tracing::warn!(error = %e, "Could not restore subscription after reconnecting");
                }
            }
            LinkOutcome::GaveUp | LinkOutcome::Superseded => return,
        }
    }
}

impl<T: Transport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("topic", &self.topic())
            .field("endpoint", &self.endpoint().map(|e| e.to_string()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::transport::{MemoryBroker, MemoryTransport};

    fn session(broker: &MemoryBroker) -> Session<MemoryTransport> {
        let config = SessionConfig::builder()
            .reconnect(ReconnectPolicy::new().with_initial_delay(Duration::from_millis(100)))
            .build();
        Session::new(broker.transport(), config)
    }

    #[tokio::test]
    async fn publish_checks_payload_then_connection_then_topic() {
        let broker = MemoryBroker::new();
        let session = session(&broker);

        assert_eq!(session.publish("").await, Err(PublishError::EmptyPayload));
        assert_eq!(session.publish("x").await, Err(PublishError::NotConnected));
        session.connect("memory://local").await.unwrap();
        assert_eq!(session.publish("x").await, Err(PublishError::NoTopic));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_uses_current_topic() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.connect("memory://local").await.unwrap();
        session.set_topic("orders").await.unwrap();

        session.publish("hello").await.unwrap();
        session.publish_to("audit", "copy").await.unwrap();

        let topics: Vec<_> = broker.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, ["orders", "audit"]);
    }

    #[tokio::test]
    async fn disconnect_clears_topic() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.connect("memory://local").await.unwrap();
        session.set_topic("orders").await.unwrap();

        session.disconnect().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.topic(), None);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn switching_broker_keeps_topic() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.connect("memory://one").await.unwrap();
        session.set_topic("orders").await.unwrap();

        session.connect("memory://two").await.unwrap();

        assert_eq!(session.endpoint().unwrap().host(), "two");
        assert_eq!(broker.active_subscriptions(), ["orders"]);
        assert_eq!(broker.max_active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reconnects_and_resubscribes() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.connect("memory://local").await.unwrap();
        session.set_topic("orders").await.unwrap();

        broker.sever();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(broker.active_subscriptions(), ["orders"]);
        broker.deliver("orders", "back");
        assert_eq!(session.inbox().try_recv().unwrap().payload_str(), "back");
    }

    #[tokio::test]
    async fn shutdown_ends_inbox() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        session.connect("memory://local").await.unwrap();

        session.shutdown().await;

        assert!(session.inbox().recv().await.is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn session_is_send_and_sync() {
        fn assert_send_sync<S: Send + Sync>() {}
        assert_send_sync::<Session<MemoryTransport>>();
    }
}
