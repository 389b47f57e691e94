// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded drop-oldest queue between the transport and the consumer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::transport::InboundMessage;

/// Generation value meaning "no subscription is accepting messages".
pub(crate) const NO_GENERATION: u64 = 0;

/// Inbound buffer shared by the transport callback and the consumer.
///
/// The active subscription generation lives under the same lock as the
/// buffer, so retiring a generation and accepting a message never interleave.
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

#[derive(Debug)]
struct QueueState {
    buffer: VecDeque<InboundMessage>,
    active_generation: u64,
    dropped: u64,
    delivered: u64,
    closed: bool,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                active_generation: NO_GENERATION,
                dropped: 0,
                delivered: 0,
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    /// Starts accepting messages tagged with `generation`.
    pub(crate) fn activate(&self, generation: u64) {
        self.state.lock().active_generation = generation;
    }

    /// Stops accepting messages for `generation` if it is still active.
    pub(crate) fn retire(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.active_generation == generation {
            state.active_generation = NO_GENERATION;
        }
    }

    /// Stops accepting messages for whichever generation is active.
    pub(crate) fn retire_active(&self) {
        self.state.lock().active_generation = NO_GENERATION;
    }

    /// Enqueues a message from `generation`; returns false if it was discarded.
    ///
    /// When the buffer is full the oldest message is evicted and counted as
    /// dropped.
    pub(crate) fn push(&self, generation: u64, message: InboundMessage) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed
                || generation == NO_GENERATION
                || state.active_generation != generation
            {
                return false;
            }
            if state.buffer.len() == self.capacity {
                state.buffer.pop_front();
                state.dropped += 1;
            }
            state.buffer.push_back(message);
        }
        self.ready.notify_one();
        true
    }

    pub(crate) fn try_pop(&self) -> Option<InboundMessage> {
        let mut state = self.state.lock();
        let message = state.buffer.pop_front();
        if message.is_some() {
            state.delivered += 1;
        }
        message
    }

    /// Waits for the next message. Returns `None` once closed and drained.
    pub(crate) async fn pop(&self) -> Option<InboundMessage> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.buffer.pop_front() {
                    state.delivered += 1;
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        // One stored permit wakes the single consumer.
        self.ready.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }
}

/// Consumer side of the inbound message queue.
///
/// Messages come out exactly once, in arrival order. The queue is meant for
/// a single consumer; clones share the same buffer and split its messages.
///
/// # Examples
///
/// ```
/// use subcon::transport::MemoryBroker;
/// use subcon::{Session, SessionConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// let session = Session::new(broker.transport(), SessionConfig::default());
/// session.connect("memory://local").await?;
/// session.set_topic("alerts").await?;
///
/// let inbox = session.inbox();
/// broker.deliver("alerts", "disk full");
/// assert_eq!(inbox.try_recv().unwrap().payload_str(), "disk full");
/// assert_eq!(inbox.dropped(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Inbox {
    queue: Arc<DeliveryQueue>,
}

impl Inbox {
    pub(crate) fn new(queue: Arc<DeliveryQueue>) -> Self {
        Self { queue }
    }

    /// Waits for the next message. Returns `None` after the session shut down.
    pub async fn recv(&self) -> Option<InboundMessage> {
        self.queue.pop().await
    }

    /// Returns the next message if one is buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<InboundMessage> {
        self.queue.try_pop()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no message is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Messages evicted because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Messages handed to the consumer so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.queue.delivered()
    }
}
