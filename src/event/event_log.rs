// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded, append-only log of status and message lines.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{LogLevel, LogLine};
use crate::config::DEFAULT_LOG_CAPACITY;

/// Append-only log of human readable lines for the display layer.
///
/// The log keeps at most `capacity` lines; once full, each append evicts
/// the oldest line. Retained lines always stay in insertion order.
///
/// `EventLog` is cheaply cloneable and every clone writes to the same log.
/// Appending never awaits, so it can be called from synchronous callbacks.
///
/// # Examples
///
/// ```
/// use subcon::event::EventLog;
///
/// let log = EventLog::with_capacity(2);
/// log.info("one");
/// log.info("two");
/// log.warn("three");
///
/// let lines: Vec<_> = log.snapshot().iter().map(|l| l.text().to_string()).collect();
/// assert_eq!(lines, ["two", "three"]);
/// assert_eq!(log.evicted(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    capacity: usize,
    state: Mutex<LogState>,
    appended: Notify,
}

#[derive(Debug)]
struct LogState {
    lines: VecDeque<LogLine>,
    next_seq: u64,
    evicted: u64,
}

impl EventLog {
    /// Creates a log with the default capacity (1000 lines).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Creates a log holding at most `capacity` lines (at least 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(EventLogInner {
                capacity,
                state: Mutex::new(LogState {
                    lines: VecDeque::with_capacity(capacity.min(1024)),
                    next_seq: 1,
                    evicted: 0,
                }),
                appended: Notify::new(),
            }),
        }
    }

    /// Appends a line and returns its sequence number.
    pub fn append(&self, level: LogLevel, text: impl Into<String>) -> u64 {
        let seq = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.lines.len() == self.inner.capacity {
                state.lines.pop_front();
                state.evicted += 1;
            }
            state.lines.push_back(LogLine::new(seq, level, text.into()));
            seq
        };
        self.inner.appended.notify_waiters();
        seq
    }

    /// Appends an [`LogLevel::Info`] line.
    pub fn info(&self, text: impl Into<String>) -> u64 {
        self.append(LogLevel::Info, text)
    }

    /// Appends a [`LogLevel::Warn`] line.
    pub fn warn(&self, text: impl Into<String>) -> u64 {
        self.append(LogLevel::Warn, text)
    }

    /// Appends a [`LogLevel::Error`] line.
    pub fn error(&self, text: impl Into<String>) -> u64 {
        self.append(LogLevel::Error, text)
    }

    /// Returns a point-in-time copy of all retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.inner.state.lock().lines.iter().cloned().collect()
    }

    /// Returns retained lines with a sequence number greater than `seq`.
    ///
    /// Passing the last sequence number a renderer has seen yields only the
    /// lines appended since.
    #[must_use]
    pub fn since(&self, seq: u64) -> Vec<LogLine> {
        let state = self.inner.state.lock();
        let start = state.lines.partition_point(|line| line.seq() <= seq);
        state.lines.range(start..).cloned().collect()
    }

    /// Waits until at least one line is appended after this call starts.
    pub async fn changed(&self) {
        self.inner.appended.notified().await;
    }

    /// Waits until a line with a sequence number greater than `seq` exists.
    ///
    /// Returns immediately if one was already appended, so a renderer that
    /// alternates [`since`](Self::since) and this call never misses a line.
    pub async fn wait_newer(&self, seq: u64) {
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.last_seq() > seq {
                return;
            }
            notified.await;
        }
    }

    /// Sequence number of the most recent line, or 0 if none was appended.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.inner.state.lock().next_seq - 1
    }

    /// Number of lines currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().lines.len()
    }

    /// Returns true if no lines are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained lines.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of lines evicted to respect the capacity.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.inner.state.lock().evicted
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.capacity(), 1000);
        assert_eq!(log.evicted(), 0);
    }

    #[test]
    fn append_assigns_increasing_sequence() {
        let log = EventLog::new();
        assert_eq!(log.info("a"), 1);
        assert_eq!(log.warn("b"), 2);
        assert_eq!(log.error("c"), 3);

        let levels: Vec<_> = log.snapshot().iter().map(LogLine::level).collect();
        assert_eq!(levels, [LogLevel::Info, LogLevel::Warn, LogLevel::Error]);
    }

    #[test]
    fn eviction_keeps_most_recent_in_order() {
        let log = EventLog::with_capacity(3);
        for i in 0..10 {
            log.info(format!("line {i}"));
        }

        let texts: Vec<_> = log.snapshot().iter().map(|l| l.text().to_string()).collect();
        assert_eq!(texts, ["line 7", "line 8", "line 9"]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.evicted(), 7);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let log = EventLog::with_capacity(0);
        log.info("a");
        log.info("b");
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].text(), "b");
    }

    #[test]
    fn since_returns_only_newer_lines() {
        let log = EventLog::with_capacity(4);
        for i in 0..6 {
            log.info(format!("{i}"));
        }
        // Retained seq 3..=6.
        let newer: Vec<_> = log.since(4).iter().map(LogLine::seq).collect();
        assert_eq!(newer, [5, 6]);
        assert_eq!(log.since(0).len(), 4);
        assert!(log.since(6).is_empty());
    }

    #[test]
    fn clones_share_the_same_log() {
        let log = EventLog::new();
        let clone = log.clone();
        clone.info("from clone");
        assert_eq!(log.snapshot()[0].text(), "from clone");
    }

    #[test]
    fn concurrent_writers_respect_bound_and_order() {
        let log = EventLog::with_capacity(100);
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.info(format!("writer {w} line {i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(log.evicted(), 3900);
        assert!(snapshot.windows(2).all(|w| w[0].seq() + 1 == w[1].seq()));
        assert_eq!(snapshot.last().unwrap().seq(), 4000);
    }

    #[tokio::test]
    async fn changed_wakes_on_append() {
        let log = EventLog::new();
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.changed().await })
        };
        tokio::task::yield_now().await;
        // The waiter may register after the first append; keep appending until it returns.
        while !waiter.is_finished() {
            log.info("tick");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        waiter.await.unwrap();
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn wait_newer_returns_for_already_appended_line() {
        let log = EventLog::new();
        assert_eq!(log.last_seq(), 0);
        log.info("early");

        tokio::time::timeout(std::time::Duration::from_secs(1), log.wait_newer(0))
            .await
            .unwrap();

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_newer(1).await })
        };
        tokio::task::yield_now().await;
        log.info("late");
        waiter.await.unwrap();
        assert_eq!(log.last_seq(), 2);
    }
}
