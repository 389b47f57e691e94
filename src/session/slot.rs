// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single active topic subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use super::{ConnectionState, ConnectionSupervisor, MessageRouter};
use crate::error::{SubscribeError, TransportError, millis};
use crate::event::EventLog;
use crate::transport::{Connection, SubscriptionHandle, Transport};

/// Holds at most one live subscription and swaps it on request.
///
/// Calls are queued on a fair async mutex, so a second `set_topic` waits for
/// the first to finish. Every subscription gets a fresh generation number
/// and the router only accepts messages carrying the active one.
pub struct SubscriptionSlot<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    router: Arc<MessageRouter<T>>,
    log: EventLog,
    subscribe_timeout: Duration,
    state: tokio::sync::Mutex<SlotState<T::Connection>>,
    /// Topic to restore after a reconnect. Readable without awaiting.
    topic: RwLock<Option<String>>,
    next_generation: AtomicU64,
}

struct SlotState<C> {
    active: Option<ActiveSubscription<C>>,
}

struct ActiveSubscription<C> {
    topic: String,
    handle: SubscriptionHandle,
    generation: u64,
    connection: Weak<C>,
}

/// What to do with the remembered topic when establishing fails.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    Forget,
    Remember,
}

impl<T: Transport> SubscriptionSlot<T> {
    /// Creates an empty slot.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor<T>>,
        router: Arc<MessageRouter<T>>,
        log: EventLog,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            router,
            log,
            subscribe_timeout,
            state: tokio::sync::Mutex::new(SlotState { active: None }),
            topic: RwLock::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the current topic, if one is selected.
    #[must_use]
    pub fn topic(&self) -> Option<String> {
        self.topic.read().clone()
    }

    /// Replaces the active subscription with one for `topic`.
    ///
    /// The previous subscription stops delivering before it is unsubscribed.
    /// A failing unsubscribe is logged and does not block the new topic.
    ///
    /// # Errors
    ///
    /// - [`SubscribeError::InvalidTopic`] if `topic` is blank
    /// - [`SubscribeError::NotConnected`] if the session is not connected
    /// - [`SubscribeError::BrokerRejected`] if the broker refused the topic
    /// - [`SubscribeError::Timeout`] if no acknowledgment arrived in time
    ///
    /// On any of the last two the slot is left empty.
    pub async fn set_topic(&self, topic: &str) -> Result<(), SubscribeError> {
        let topic = topic.trim();
        if topic.is_empty() {
            self.log.error("Enter a valid topic.");
            return Err(SubscribeError::InvalidTopic);
        }

        let mut state = self.state.lock().await;
        let Some(connection) = self.live_connection() else {
            self.log.error("Connect to a broker before choosing a topic.");
            return Err(SubscribeError::NotConnected);
        };

        self.teardown(&mut state).await;
        self.establish(&mut state, &connection, topic, OnFailure::Forget)
            .await
    }

    /// Subscribes the remembered topic again on the current connection.
    ///
    /// Used after a reconnect or a broker switch. Does nothing if no topic
    /// is selected. The topic stays remembered if this fails.
    ///
    /// # Errors
    ///
    /// Same as [`set_topic`](Self::set_topic), minus `InvalidTopic`.
    pub async fn resubscribe(&self) -> Result<(), SubscribeError> {
        let mut state = self.state.lock().await;
        let Some(topic) = self.topic() else {
            return Ok(());
        };
        let Some(connection) = self.live_connection() else {
            return Err(SubscribeError::NotConnected);
        };

        tracing::debug!(topic = %topic, "Restoring subscription");
        self.teardown(&mut state).await;
        self.establish(&mut state, &connection, &topic, OnFailure::Remember)
            .await
    }

    /// Tears down the active subscription and forgets the topic.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
        *self.topic.write() = None;
    }

    /// State observer hook: stops delivery as soon as the link is gone.
    pub(crate) fn on_transition(&self, previous: ConnectionState, next: ConnectionState) {
        if previous.is_connected() && !next.is_connected() {
            self.router.retire_active();
        }
    }

    fn live_connection(&self) -> Option<Arc<T::Connection>> {
        if !self.supervisor.state().is_connected() {
            return None;
        }
        self.supervisor.connection()
    }

    async fn teardown(&self, state: &mut SlotState<T::Connection>) {
        let Some(active) = state.active.take() else {
            return;
        };
        self.router.retire(active.generation);

        let Some(connection) = active.connection.upgrade().filter(|c| c.is_open()) else {
            // The broker dropped the subscription along with the connection.
            tracing::debug!(topic = %active.topic, "Discarded subscription of a closed connection");
            return;
        };

        match connection.unsubscribe(active.handle).await {
            Ok(()) => {
                tracing::info!(topic = %active.topic, handle = %active.handle, "Unsubscribed");
                self.log
                    .info(format!("Unsubscribed from topic: {}", active.topic));
            }
            Err(e) => {
                tracing::warn!(topic = %active.topic, error = %e, "Unsubscribe failed");
                self.log.warn(format!(
                    "Unable to unsubscribe from topic: {} ({e})",
                    active.topic
                ));
            }
        }
    }

    async fn establish(
        &self,
        state: &mut SlotState<T::Connection>,
        connection: &Arc<T::Connection>,
        topic: &str,
        on_failure: OnFailure,
    ) -> Result<(), SubscribeError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.router.activate(generation);
        let callback = self.router.callback_for(generation);

        let result = tokio::time::timeout(
            self.subscribe_timeout,
            connection.subscribe(topic, callback),
        )
        .await;

        let error = match result {
            Ok(Ok(handle)) => {
                state.active = Some(ActiveSubscription {
                    topic: topic.to_string(),
                    handle,
                    generation,
                    connection: Arc::downgrade(connection),
                });
                *self.topic.write() = Some(topic.to_string());
                tracing::info!(topic = %topic, handle = %handle, generation, "Subscribed");
                self.log.info(format!("Listening on topic: {topic}"));
                return Ok(());
            }
            Ok(Err(TransportError::Closed)) => SubscribeError::NotConnected,
            Ok(Err(e)) => SubscribeError::BrokerRejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            },
            Err(_) => SubscribeError::Timeout(millis(self.subscribe_timeout)),
        };

        self.router.retire(generation);
        if on_failure == OnFailure::Forget {
            *self.topic.write() = None;
        }
        tracing::warn!(topic = %topic, error = %error, "Subscription failed");
        match &error {
            SubscribeError::Timeout(_) => self
                .log
                .error(format!("Timeout: no acknowledgment for topic {topic}.")),
            other => self.log.error(format!("Subscription error: {other}")),
        };
        Err(error)
    }
}

impl<T: Transport> std::fmt::Debug for SubscriptionSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSlot")
            .field("topic", &self.topic())
            .finish_non_exhaustive()
    }
}
