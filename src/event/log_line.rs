// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity of a [`LogLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal status or message traffic.
    Info,
    /// Something failed but the session carried on.
    Warn,
    /// An operation failed.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single timestamped line in the [`EventLog`](super::EventLog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    seq: u64,
    timestamp: DateTime<Utc>,
    level: LogLevel,
    text: String,
}

impl LogLine {
    pub(crate) fn new(seq: u64, level: LogLevel, text: String) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            level,
            text,
        }
    }

    /// Position of this line in the log, starting at 1.
    ///
    /// Sequence numbers are never reused, so they keep increasing across
    /// evictions.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// When the line was appended.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Severity of the line.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// The human readable text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.timestamp.format("%H:%M:%S"))?;
        if self.level != LogLevel::Info {
            write!(f, "{}: ", self.level)?;
        }
        f.write_str(&self.text)
    }
}
