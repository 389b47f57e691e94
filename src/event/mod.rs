// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-visible event log.
//!
//! Every session component writes status lines ("Connected to ...",
//! "Listening on ...", "Received: ...") into a shared [`EventLog`]. The
//! display layer renders [`EventLog::snapshot`] or polls
//! [`EventLog::since`] for new lines.
//!
//! # Examples
//!
//! ```
//! use subcon::event::{EventLog, LogLevel};
//!
//! let log = EventLog::new();
//! log.append(LogLevel::Info, "Connected to mqtt://localhost:1883");
//!
//! for line in log.snapshot() {
//!     println!("{line}");
//! }
//! ```

mod event_log;
mod log_line;

pub use event_log::EventLog;
pub use log_line::{LogLevel, LogLine};
