// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection lifecycle for a single broker endpoint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::config::ReconnectPolicy;
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, millis};
use crate::event::EventLog;
use crate::transport::{Connection, Transport};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// A connection attempt (or reconnection) is running.
    Connecting,
    /// Connected and operational.
    Connected,
    /// The last attempt failed; `connect` may be called again.
    Failed,
}

impl ConnectionState {
    /// Returns true if the session is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true if the last attempt failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identifier returned by [`ConnectionSupervisor::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback receiving `(previous, next)` on every state transition.
type StateObserver = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// What happened after [`ConnectionSupervisor::connection_lost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A new connection is up.
    Reconnected,
    /// Reconnection is disabled or every retry failed.
    GaveUp,
    /// A disconnect or a newer connect took over.
    Superseded,
}

struct Link<C> {
    connection: Arc<C>,
    endpoint: Endpoint,
    generation: u64,
}

/// Owns the single broker connection of a session.
///
/// All transitions go through one lock and notify observers before the
/// mutating call returns, so observers never see a half-applied state.
/// Observers must not call back into the supervisor.
pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    log: EventLog,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    transition_lock: Mutex<()>,
    observers: RwLock<Vec<(ObserverId, StateObserver)>>,
    next_observer: AtomicU64,
    link: RwLock<Option<Link<T::Connection>>>,
    /// In-flight attempt: its id and cancellation signal.
    attempt: Mutex<Option<(u64, watch::Sender<bool>)>>,
    next_attempt: AtomicU64,
    /// Bumped whenever the current link is replaced, lost or released.
    generation: watch::Sender<u64>,
}

/// A registered connection attempt.
///
/// Holds the cancellation signal and clears the attempt slot when dropped.
struct Attempt<'a> {
    slot: &'a Mutex<Option<(u64, watch::Sender<bool>)>>,
    id: u64,
    cancel: watch::Receiver<bool>,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *slot = None;
        }
    }
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Creates a disconnected supervisor.
    pub fn new(transport: T, log: EventLog, connect_timeout: Duration, reconnect: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (generation, _) = watch::channel(0);
        Self {
            transport,
            log,
            connect_timeout,
            reconnect,
            state,
            transition_lock: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            link: RwLock::new(None),
            attempt: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
            generation,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes asynchronously.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Registers a synchronous observer for state transitions.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Removes an observer. Returns `true` if it was registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Returns the live connection, if connected.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<T::Connection>> {
        self.link
            .read()
            .as_ref()
            .map(|link| Arc::clone(&link.connection))
    }

    /// Returns the live connection together with its generation.
    pub(crate) fn current_link(&self) -> Option<(u64, Arc<T::Connection>)> {
        self.link
            .read()
            .as_ref()
            .map(|link| (link.generation, Arc::clone(&link.connection)))
    }

    /// Returns the endpoint of the live connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.link.read().as_ref().map(|link| link.endpoint.clone())
    }

    fn transition(&self, next: ConnectionState) {
        let _serialized = self.transition_lock.lock();
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        tracing::debug!(from = %previous, to = %next, "Connection state changed");

        let observers: Vec<StateObserver> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(previous, next);
        }
    }

    fn bump_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    /// Connects to `endpoint`, replacing any existing connection.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::InvalidEndpoint`] if `endpoint` cannot be parsed
    /// - [`ConnectError::InProgress`] if another attempt is running
    /// - [`ConnectError::Timeout`] / [`ConnectError::Refused`] from the transport
    /// - [`ConnectError::Cancelled`] if [`disconnect`](Self::disconnect) interrupted it
    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectError> {
        let endpoint = match Endpoint::parse(endpoint) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.log.error("Enter a valid broker endpoint.");
                return Err(e);
            }
        };

        let mut attempt = match self.begin_attempt() {
            Ok(attempt) => attempt,
            Err(e) => {
                self.log.warn("A connection attempt is already in progress.");
                return Err(e);
            }
        };

        // Also stops a reconnect loop waiting out its backoff.
        self.bump_generation();
        let previous = self.link.write().take();
        if let Some(previous) = previous {
            previous.connection.close().await;
            tracing::info!(endpoint = %previous.endpoint, "Released previous connection");
            self.log
                .info(format!("Disconnected from broker: {}", previous.endpoint));
        }

        self.transition(ConnectionState::Connecting);
        match self.run_attempt(&mut attempt, &endpoint).await {
            Ok(()) => Ok(()),
            Err(ConnectError::Cancelled) => Err(ConnectError::Cancelled),
            Err(e) => {
                self.report_failure(&e);
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn report_failure(&self, error: &ConnectError) {
        tracing::warn!(error = %error, "Connection attempt failed");
        match error {
            ConnectError::Timeout(_) => self.log.error("Timeout: unable to connect to the broker."),
            other => self.log.error(format!("Connection error: {other}")),
        };
    }

    fn begin_attempt(&self) -> Result<Attempt<'_>, ConnectError> {
        let mut slot = self.attempt.lock();
        if slot.is_some() {
            return Err(ConnectError::InProgress);
        }
        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (tx, cancel) = watch::channel(false);
        *slot = Some((id, tx));
        Ok(Attempt {
            slot: &self.attempt,
            id,
            cancel,
        })
    }

    /// Runs a registered attempt. The caller has already moved to `Connecting`.
    async fn run_attempt(
        &self,
        attempt: &mut Attempt<'_>,
        endpoint: &Endpoint,
    ) -> Result<(), ConnectError> {
        let id = attempt.id;
        tracing::info!(endpoint = %endpoint, "Connecting to broker");

        let timeout = self.connect_timeout;
        let connection = tokio::select! {
            biased;
            _ = attempt.cancel.wait_for(|cancelled| *cancelled) => return Err(ConnectError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.connect(endpoint, timeout)) => {
                match result {
                    Ok(Ok(connection)) => connection,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ConnectError::Timeout(millis(timeout))),
                }
            }
        };

        // Decide under the attempt lock so a concurrent disconnect either
        // cancels us first or finds the stored link.
        let outcome = {
            let slot = self.attempt.lock();
            let still_ours = slot.as_ref().is_some_and(|(aid, tx)| *aid == id && !*tx.borrow());
            if still_ours {
                let generation = self.bump_generation();
                *self.link.write() = Some(Link {
                    connection: Arc::new(connection),
                    endpoint: endpoint.clone(),
                    generation,
                });
                self.transition(ConnectionState::Connected);
                Ok(())
            } else {
                Err(connection)
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(endpoint = %endpoint, "Connected to broker");
                self.log.info(format!("Connected to broker: {endpoint}"));
                Ok(())
            }
            Err(connection) => {
                connection.close().await;
                Err(ConnectError::Cancelled)
            }
        }
    }

    /// Disconnects and moves to [`ConnectionState::Disconnected`].
    ///
    /// Idempotent. An in-flight attempt is cancelled and its partially
    /// opened connection released.
    pub async fn disconnect(&self) {
        let cancelled = self
            .attempt
            .lock()
            .take()
            .map(|(_, tx)| tx.send_replace(true))
            .is_some();
        if cancelled {
            tracing::debug!("Cancelled in-flight connection attempt");
            self.log.info("Connection attempt cancelled.");
        }

        // Stops any reconnect loop waiting on the generation.
        self.bump_generation();

        let link = self.link.write().take();
        if let Some(link) = link {
            link.connection.close().await;
            tracing::info!(endpoint = %link.endpoint, "Disconnected from broker");
            self.log.info(format!("Disconnected from broker: {}", link.endpoint));
        }

        self.transition(ConnectionState::Disconnected);
    }

    /// Handles the loss of the link with the given generation.
    ///
    /// Retries with exponential backoff per the [`ReconnectPolicy`]. Stays in
    /// `Connecting` while retrying and ends in `Connected` or `Failed`.
    pub(crate) async fn connection_lost(&self, generation: u64) -> LinkOutcome {
        let lost = {
            let mut link = self.link.write();
            match link.as_ref() {
                Some(current) if current.generation == generation => link.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else {
            return LinkOutcome::Superseded;
        };
        let lost_generation = self.bump_generation();
        lost.connection.close().await;
        let endpoint = lost.endpoint;

        tracing::warn!(endpoint = %endpoint, "Connection to broker lost");
        self.log.warn(format!("Connection to broker lost: {endpoint}"));

        if !self.reconnect.enabled {
            self.transition(ConnectionState::Disconnected);
            return LinkOutcome::GaveUp;
        }

        self.transition(ConnectionState::Connecting);
        let mut generation_rx = self.generation.subscribe();
        let mut attempt = 0;

        while self.reconnect.should_retry(attempt) {
            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt += 1;
            tracing::debug!(attempt, delay_ms = millis(delay), "Waiting before reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = generation_rx.wait_for(|g| *g != lost_generation) => return LinkOutcome::Superseded,
            }

            let Ok(mut registered) = self.begin_attempt() else {
                return LinkOutcome::Superseded;
            };
            self.log.info(format!("Reconnecting to {endpoint} (attempt {attempt})"));
            match self.run_attempt(&mut registered, &endpoint).await {
                Ok(()) => return LinkOutcome::Reconnected,
                Err(ConnectError::Cancelled) => return LinkOutcome::Superseded,
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                    self.log.warn(format!("Reconnect attempt {attempt} failed: {e}"));
                }
            }

            if *generation_rx.borrow() != lost_generation {
                return LinkOutcome::Superseded;
            }
        }

        tracing::error!(endpoint = %endpoint, attempts = attempt, "Giving up reconnecting");
        self.log.error(format!("Unable to reconnect to {endpoint} after {attempt} attempts."));
        self.transition(ConnectionState::Failed);
        LinkOutcome::GaveUp
    }
}

impl<T: Transport> fmt::Debug for ConnectionSupervisor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint().map(|e| e.to_string()))
            .finish_non_exhaustive()
    }
}
