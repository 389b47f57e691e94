// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process broker.
//!
//! [`MemoryBroker`] routes messages between [`MemoryConnection`]s inside the
//! current process. It also exposes knobs to make the broker misbehave
//! (refuse connections, stall, reject topics, drop links) so session
//! behaviour can be exercised without a network.
//!
//! # Examples
//!
//! ```
//! use subcon::transport::MemoryBroker;
//! use subcon::{Session, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let session = Session::new(broker.transport(), SessionConfig::default());
//!
//! session.connect("memory://local").await?;
//! session.set_topic("orders").await?;
//! broker.deliver("orders", "hello");
//!
//! let msg = session.inbox().recv().await.unwrap();
//! assert_eq!(msg.payload_str(), "hello");
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Connection, InboundMessage, MessageCallback, SubscriptionHandle, Transport, topic_matches};
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, TransportError};

/// An in-process message broker.
///
/// Cloning a `MemoryBroker` yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, watch::Sender<bool>>,
    subscriptions: HashMap<u64, MemorySubscription>,
    published: Vec<(String, Bytes)>,
    max_active_subscriptions: usize,
    connect_attempts: u32,
    refuse_connections: bool,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    rejected_topics: HashSet<String>,
    fail_unsubscribe: bool,
}

struct MemorySubscription {
    connection_id: u64,
    filter: String,
    callback: MessageCallback,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport that connects to this broker.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Makes new connection attempts fail with [`ConnectError::Refused`].
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.state.lock().refuse_connections = refuse;
    }

    /// Delays every connection attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().connect_delay = delay;
    }

    /// Delays every subscription acknowledgment by `delay`.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().subscribe_delay = delay;
    }

    /// Makes subscriptions to `topic` fail.
    pub fn reject_topic(&self, topic: impl Into<String>) {
        self.inner.state.lock().rejected_topics.insert(topic.into());
    }

    /// Makes unsubscribe requests fail; the subscription stays registered.
    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.inner.state.lock().fail_unsubscribe = fail;
    }

    /// Delivers a message to every matching subscription.
    ///
    /// Returns the number of callbacks invoked.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let callbacks: Vec<MessageCallback> = {
            let state = self.inner.state.lock();
            state
                .subscriptions
                .values()
                .filter(|sub| topic_matches(&sub.filter, topic))
                .map(|sub| Arc::clone(&sub.callback))
                .collect()
        };

        for callback in &callbacks {
            callback(InboundMessage::new(topic, payload.clone()));
        }
        callbacks.len()
    }

    /// Drops every open connection as if the network failed.
    pub fn sever(&self) {
        let senders: Vec<watch::Sender<bool>> = {
            let mut state = self.inner.state.lock();
            state.subscriptions.clear();
            state.connections.drain().map(|(_, tx)| tx).collect()
        };
        tracing::debug!(count = senders.len(), "Severing memory connections");
        for tx in senders {
            tx.send_replace(true);
        }
    }

    /// Topics of the currently registered subscriptions.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut topics: Vec<_> = state
            .subscriptions
            .values()
            .map(|sub| sub.filter.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Highest number of simultaneously registered subscriptions seen so far.
    #[must_use]
    pub fn max_active_subscriptions(&self) -> usize {
        self.inner.state.lock().max_active_subscriptions
    }

    /// Every message published through this broker, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.state.lock().published.clone()
    }

    /// Number of connection attempts, including refused ones.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().connect_attempts
    }

    /// Number of open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    fn remove_connection(&self, connection_id: u64) {
        let mut state = self.inner.state.lock();
        state
            .subscriptions
            .retain(|_, sub| sub.connection_id != connection_id);
        state.connections.remove(&connection_id);
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("connections", &state.connections.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish_non_exhaustive()
    }
}

/// [`Transport`] that connects to a [`MemoryBroker`].
///
/// Any endpoint is accepted; the address only shows up in logs.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    /// Returns the broker this transport connects to.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<MemoryConnection, ConnectError> {
        let delay = {
            let mut state = self.broker.inner.state.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.broker.next_id();
        let (closed_tx, _) = watch::channel(false);
        {
            let mut state = self.broker.inner.state.lock();
            if state.refuse_connections {
                return Err(ConnectError::Refused(format!(
                    "memory broker refused {endpoint}"
                )));
            }
            state.connections.insert(id, closed_tx.clone());
        }

        tracing::debug!(endpoint = %endpoint, connection = id, "Memory connection opened");

        Ok(MemoryConnection {
            id,
            broker: self.broker.clone(),
            closed: closed_tx,
        })
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

impl Connection for MemoryConnection {
    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, TransportError> {
        self.ensure_open()?;

        let delay = self.broker.inner.state.lock().subscribe_delay;
        if let Some(delay) = delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.closed() => return Err(TransportError::Closed),
            }
        }

        let id = self.broker.next_id();
        let mut state = self.broker.inner.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        if state.rejected_topics.contains(topic) {
            return Err(TransportError::Rejected(format!("subscription to {topic} refused")));
        }

        state.subscriptions.insert(
            id,
            MemorySubscription {
                connection_id: self.id,
                filter: topic.to_string(),
                callback,
            },
        );
        state.max_active_subscriptions = state.max_active_subscriptions.max(state.subscriptions.len());
        Ok(SubscriptionHandle::new(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        self.ensure_open()?;

        let mut state = self.broker.inner.state.lock();
        if state.fail_unsubscribe {
            return Err(TransportError::Rejected("unsubscribe refused".to_string()));
        }
        match state.subscriptions.get(&handle.value()) {
            Some(sub) if sub.connection_id == self.id => {
                state.subscriptions.remove(&handle.value());
                Ok(())
            }
            _ => Err(TransportError::UnknownHandle),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker
            .inner
            .state
            .lock()
            .published
            .push((topic.to_string(), payload.clone()));
        self.broker.deliver(topic, payload);
        Ok(())
    }

    async fn close(&self) {
        self.broker.remove_connection(self.id);
        self.closed.send_replace(true);
        tracing::debug!(connection = self.id, "Memory connection closed");
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so wait_for can only end with `true`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.remove_connection(self.id);
    }
}
