// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broker transport boundary.
//!
//! The session core never talks to a broker client library directly. It
//! goes through the [`Transport`] and [`Connection`] traits, which mirror
//! the calls every pub/sub client offers: connect, subscribe with a
//! callback, unsubscribe, publish and close.
//!
//! # Implementations
//!
//! - [`MqttTransport`]: MQTT 3.1.1 via `rumqttc` (feature `mqtt`, enabled by default)
//! - [`MemoryTransport`]: an in-process broker, useful for tests and demos

mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;
mod topic;

pub use memory::{MemoryBroker, MemoryConnection, MemoryTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnection, MqttTransport, MqttTransportBuilder};
pub use topic::topic_matches;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::endpoint::Endpoint;
use crate::error::{ConnectError, TransportError};

/// Callback invoked by a transport for every message on a subscription.
///
/// Transports call it from their read loop, so it must return quickly.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// The topic the message was published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The raw payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// When the transport handed the message to the session.
    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Opaque identifier of a broker-side subscription.
///
/// Handles are only meaningful to the [`Connection`] that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Creates a handle with the given value.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// Factory for broker connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by [`connect`](Self::connect).
    type Connection: Connection;

    /// Opens a session with the broker at `endpoint`.
    ///
    /// Implementations should give up after `timeout`. Dropping the returned
    /// future before it completes must release any partially opened socket.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Timeout`] if the handshake does not finish in
    /// time and [`ConnectError::Refused`] if the broker or network refuses.
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;
}

/// An open broker session.
pub trait Connection: Send + Sync + 'static {
    /// Registers interest in `topic`; `callback` receives every matching message.
    ///
    /// Resolves once the broker acknowledged the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] if the broker refuses and
    /// [`TransportError::Closed`] if the connection is gone.
    fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> impl Future<Output = Result<SubscriptionHandle, TransportError>> + Send;

    /// Removes a subscription. No more messages reach its callback afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker could not be told.
    fn unsubscribe(
        &self,
        handle: SubscriptionHandle,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Hands a message to the transport for delivery.
    ///
    /// Resolves when the transport accepted the message, not when the broker
    /// stored it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Closes the session and releases the socket.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Resolves once the session is closed, locally or by a link failure.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Returns whether the session is still open.
    fn is_open(&self) -> bool;
}
