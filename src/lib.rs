// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `subcon` - a single-topic publish/subscribe messaging console core.
//!
//! This library keeps one connection to a message broker, one active topic
//! subscription and an append-only event log that a display layer can
//! render. The terminal front end shipped as the `subcon` binary is one
//! such display layer.
//!
//! # Features
//!
//! - **Connection lifecycle**: bounded connect timeout, cancellable attempts,
//!   observable state, reconnect with exponential backoff
//! - **Topic swapping**: at most one live subscription; messages from the
//!   previous topic are never delivered after a swap starts
//! - **Inbound delivery**: bounded drop-oldest queue, pull or callback consumer
//! - **Event log**: bounded, ordered, safe to append from any thread
//!
//! # Transports
//!
//! - MQTT 3.1.1 via `rumqttc` (feature `mqtt`, enabled by default)
//! - An in-process broker ([`transport::MemoryBroker`]) for tests and demos
//!
//! # Quick Start
//!
//! ```no_run
//! use subcon::transport::MqttTransport;
//! use subcon::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> subcon::Result<()> {
//!     let session = Session::new(MqttTransport::new(), SessionConfig::default());
//!
//!     session.connect("mqtt://192.168.1.50:1883").await?;
//!     session.set_topic("orders").await?;
//!     session.publish("order #42 shipped").await?;
//!
//!     let inbox = session.inbox();
//!     while let Some(message) = inbox.recv().await {
//!         println!("{}: {}", message.topic(), message.payload_str());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Rendering the event log
//!
//! ```no_run
//! # async fn render(session: subcon::Session<subcon::transport::MemoryTransport>) {
//! let log = session.log().clone();
//! let mut last_seq = 0;
//! loop {
//!     for line in log.since(last_seq) {
//!         println!("{line}");
//!         last_seq = line.seq();
//!     }
//!     log.wait_newer(last_seq).await;
//! }
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod session;
pub mod transport;

pub use config::{ReconnectPolicy, SessionConfig, SessionConfigBuilder};
pub use endpoint::Endpoint;
pub use error::{ConfigError, ConnectError, Error, PublishError, Result, SubscribeError, TransportError};
pub use event::{EventLog, LogLevel, LogLine};
pub use session::{
    ConnectionState, ConnectionSupervisor, Inbox, LinkOutcome, MessageRouter, ObserverId, Session,
    SubscriptionSlot,
};
pub use transport::{Connection, InboundMessage, MessageCallback, SubscriptionHandle, Transport};
