// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Returns true if `topic` matches the subscription `filter`.
///
/// Filters use MQTT wildcards: `+` matches exactly one level, `#` matches
/// the remaining levels (including none) and must be last. Topics starting
/// with `$` are not matched by a leading wildcard.
///
/// # Examples
///
/// ```
/// use subcon::transport::topic_matches;
///
/// assert!(topic_matches("orders/+/created", "orders/eu/created"));
/// assert!(topic_matches("orders/#", "orders"));
/// assert!(!topic_matches("orders/+", "orders/eu/created"));
/// ```
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("orders", "orders"));
        assert!(!topic_matches("orders", "alerts"));
        assert!(!topic_matches("orders", "orders/eu"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("stat/+/POWER", "stat/plug/POWER"));
        assert!(!topic_matches("stat/+/POWER", "stat/plug/RESULT"));
        assert!(!topic_matches("stat/+", "stat"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(!topic_matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn system_topics_skip_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(!topic_matches("+/uptime", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }
}
