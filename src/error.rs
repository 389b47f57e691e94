// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `subcon` session core.
//!
//! Each user-facing operation has its own error enum so callers can match on
//! exactly the failures that operation can produce:
//!
//! - [`ConnectError`] for [`Session::connect`](crate::Session::connect)
//! - [`SubscribeError`] for [`Session::set_topic`](crate::Session::set_topic)
//! - [`PublishError`] for [`Session::publish`](crate::Session::publish)
//!
//! [`TransportError`] describes failures reported by a broker client library,
//! and [`Error`] wraps everything for callers that do not care which
//! operation failed.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing the broker connection failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Changing the subscribed topic failed.
    #[error("subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    /// Publishing a message failed.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Loading the session configuration failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors returned when connecting to a broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The broker did not complete the handshake within the timeout.
    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    /// The broker or network refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A disconnect was requested while the attempt was in flight.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Another connection attempt is already running.
    #[error("a connection attempt is already in progress")]
    InProgress,
}

/// Errors returned when changing the subscribed topic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The session is not connected to a broker.
    #[error("not connected to a broker")]
    NotConnected,

    /// The broker refused the subscription.
    #[error("broker rejected subscription to {topic}: {reason}")]
    BrokerRejected {
        /// The topic that was refused.
        topic: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// The broker did not acknowledge the subscription in time.
    #[error("subscription timed out after {0} ms")]
    Timeout(u64),

    /// The topic name is empty.
    #[error("topic must not be empty")]
    InvalidTopic,
}

/// Errors returned when publishing a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The session is not connected to a broker.
    #[error("not connected to a broker")]
    NotConnected,

    /// The payload is empty.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// No topic is selected to publish to.
    #[error("no topic selected")]
    NoTopic,

    /// The transport failed to accept the message.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// MQTT client request failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The broker answered a request with a failure code.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// The handle does not belong to this connection.
    #[error("unknown subscription handle")]
    UnknownHandle,
}

/// Errors related to loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that failed to load.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`SessionConfig`](crate::SessionConfig).
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is outside its allowed range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

/// Converts a [`std::time::Duration`] to whole milliseconds for error reporting.
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_display() {
        let err = ConnectError::Timeout(5000);
        assert_eq!(err.to_string(), "connection timed out after 5000 ms");
    }

    #[test]
    fn subscribe_error_display() {
        let err = SubscribeError::BrokerRejected {
            topic: "orders".to_string(),
            reason: "not authorized".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "broker rejected subscription to orders: not authorized"
        );
    }

    #[test]
    fn error_from_publish_error() {
        let err: Error = PublishError::EmptyPayload.into();
        assert!(matches!(err, Error::Publish(PublishError::EmptyPayload)));
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(std::time::Duration::from_secs(5)), 5000);
        assert_eq!(millis(std::time::Duration::MAX), u64::MAX);
    }
}
